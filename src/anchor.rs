// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/anchor.rs - 锚框网格生成
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::geometry::{BoundingBox, GeometryError, ImageSize};

const RETINANET_LEVELS: [u8; 5] = [3, 4, 5, 6, 7];
const RETINANET_CHANNELS: u32 = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnchorError {
  #[error("几何参数错误: {0}")]
  Geometry(#[from] GeometryError),
  #[error("金字塔层 P{0} 的步长为 0")]
  ZeroStride(u8),
  #[error("金字塔层 P{0} 没有锚框模板")]
  NoTemplates(u8),
  #[error("锚框模板参数无效: 尺寸 {size}, 宽高比 {ratio}")]
  InvalidTemplate { size: f32, ratio: f32 },
}

/// 以原点为中心的锚框模板
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorTemplate {
  pub width: f32,
  pub height: f32,
}

impl AnchorTemplate {
  /// `size` 为模板面积的平方根，`ratio` 为高宽比 (h / w)
  pub fn from_size_ratio(size: f32, ratio: f32) -> Result<Self, AnchorError> {
    if !(size.is_finite() && ratio.is_finite()) || size <= 0.0 || ratio <= 0.0 {
      return Err(AnchorError::InvalidTemplate { size, ratio });
    }
    let h_ratio = ratio.sqrt();
    Ok(Self {
      width: size / h_ratio,
      height: size * h_ratio,
    })
  }

  /// 宽高比在外层、尺寸在内层的笛卡尔积
  pub fn cross(sizes: &[f32], ratios: &[f32]) -> Result<Vec<Self>, AnchorError> {
    let mut templates = Vec::with_capacity(sizes.len() * ratios.len());
    for &ratio in ratios {
      for &size in sizes {
        templates.push(Self::from_size_ratio(size, ratio)?);
      }
    }
    Ok(templates)
  }

  /// 将模板平移到 (cx, cy)
  pub fn at(&self, cx: f32, cy: f32) -> BoundingBox {
    BoundingBox::from_center(cx, cy, self.width, self.height)
  }
}

/// 金字塔层描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidLevel {
  /// 层号，例如 P3 为 3
  pub index: u8,
  /// 每个网格单元对应的像素数
  pub stride: u32,
  /// 特征通道数
  pub channels: u32,
  pub templates: Vec<AnchorTemplate>,
}

impl PyramidLevel {
  pub fn name(&self) -> String {
    format!("P{}", self.index)
  }

  fn validate(&self) -> Result<(), AnchorError> {
    if self.stride == 0 {
      return Err(AnchorError::ZeroStride(self.index));
    }
    if self.templates.is_empty() {
      return Err(AnchorError::NoTemplates(self.index));
    }
    Ok(())
  }
}

/// 锚框模板配置（RetinaNet 方案）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
  /// `base_level` 层的基础尺寸，每升一层翻倍
  pub base_size: f32,
  pub base_level: u8,
  /// 相对于基础尺寸的缩放
  pub scales: Vec<f32>,
  /// 高宽比 (h / w)
  pub aspect_ratios: Vec<f32>,
}

impl Default for AnchorConfig {
  fn default() -> Self {
    Self {
      base_size: 32.0,
      base_level: 3,
      scales: vec![1.0, 2f32.powf(1.0 / 3.0), 2f32.powf(2.0 / 3.0)],
      aspect_ratios: vec![0.5, 1.0, 2.0],
    }
  }
}

impl AnchorConfig {
  pub fn template_count(&self) -> usize {
    self.scales.len() * self.aspect_ratios.len()
  }

  pub fn sizes_for(&self, level: u8) -> Vec<f32> {
    let octave = i32::from(level) - i32::from(self.base_level);
    let base = self.base_size * 2f32.powi(octave);
    self.scales.iter().map(|s| base * s).collect()
  }

  pub fn templates_for(&self, level: u8) -> Result<Vec<AnchorTemplate>, AnchorError> {
    AnchorTemplate::cross(&self.sizes_for(level), &self.aspect_ratios)
  }

  /// 描述一个层；步长由推理引擎给出
  pub fn level(&self, index: u8, stride: u32, channels: u32) -> Result<PyramidLevel, AnchorError> {
    Ok(PyramidLevel {
      index,
      stride,
      channels,
      templates: self.templates_for(index)?,
    })
  }

  /// 标准五层 P3-P7 金字塔，步长 2^l
  pub fn retinanet_levels(&self) -> Result<Vec<PyramidLevel>, AnchorError> {
    RETINANET_LEVELS
      .iter()
      .map(|&l| self.level(l, 1u32 << l, RETINANET_CHANNELS))
      .collect()
  }
}

/// 网格单元数（列 x 行）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
  pub width: u32,
  pub height: u32,
}

impl GridShape {
  pub fn cells(&self) -> usize {
    self.width as usize * self.height as usize
  }
}

/// 单层锚框统计，不需要生成锚框本身
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorStats {
  pub level: u8,
  pub stride: u32,
  pub grid: GridShape,
  pub templates: usize,
  pub total: usize,
}

/// 某一层在给定图像上的完整锚框集合
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorGrid {
  pub level: u8,
  pub stride: u32,
  pub grid: GridShape,
  pub templates: Vec<AnchorTemplate>,
  /// 行优先的单元顺序，每个单元内依模板顺序排列
  pub boxes: Vec<BoundingBox>,
}

impl AnchorGrid {
  pub fn len(&self) -> usize {
    self.boxes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.boxes.is_empty()
  }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnchorGridGenerator;

impl AnchorGridGenerator {
  pub fn grid_shape(
    &self,
    level: &PyramidLevel,
    image_size: ImageSize,
  ) -> Result<GridShape, AnchorError> {
    ImageSize::new(image_size.width, image_size.height)?;
    level.validate()?;
    Ok(GridShape {
      width: image_size.width.div_ceil(level.stride),
      height: image_size.height.div_ceil(level.stride),
    })
  }

  pub fn stats(&self, level: &PyramidLevel, image_size: ImageSize) -> Result<AnchorStats, AnchorError> {
    let grid = self.grid_shape(level, image_size)?;
    Ok(AnchorStats {
      level: level.index,
      stride: level.stride,
      grid,
      templates: level.templates.len(),
      total: grid.cells() * level.templates.len(),
    })
  }

  pub fn pyramid_stats(
    &self,
    levels: &[PyramidLevel],
    image_size: ImageSize,
  ) -> Result<Vec<AnchorStats>, AnchorError> {
    levels.iter().map(|l| self.stats(l, image_size)).collect()
  }

  /// 按索引取单个锚框；索引越界返回 None
  pub fn anchor_at(&self, level: &PyramidLevel, grid: GridShape, index: usize) -> Option<BoundingBox> {
    let per_cell = level.templates.len();
    if per_cell == 0 || index >= grid.cells() * per_cell {
      return None;
    }
    let cell = index / per_cell;
    let template = &level.templates[index % per_cell];
    let row = (cell / grid.width as usize) as f32;
    let col = (cell % grid.width as usize) as f32;
    let stride = level.stride as f32;
    Some(template.at(stride * (col + 0.5), stride * (row + 0.5)))
  }

  pub fn generate(&self, level: &PyramidLevel, image_size: ImageSize) -> Result<AnchorGrid, AnchorError> {
    let grid = self.grid_shape(level, image_size)?;
    let stride = level.stride as f32;

    let mut boxes = Vec::with_capacity(grid.cells() * level.templates.len());
    for row in 0..grid.height {
      let cy = stride * (row as f32 + 0.5);
      for col in 0..grid.width {
        let cx = stride * (col as f32 + 0.5);
        boxes.extend(level.templates.iter().map(|t| t.at(cx, cy)));
      }
    }

    debug!(
      "{}: 网格 {}x{}, {} 个模板, 共 {} 个锚框",
      level.name(),
      grid.width,
      grid.height,
      level.templates.len(),
      boxes.len()
    );

    Ok(AnchorGrid {
      level: level.index,
      stride: level.stride,
      grid,
      templates: level.templates.clone(),
      boxes,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn level(stride: u32, templates: usize) -> PyramidLevel {
    let ratios = [0.5, 1.0, 2.0, 3.0];
    PyramidLevel {
      index: 5,
      stride,
      channels: 256,
      templates: AnchorTemplate::cross(&[64.0], &ratios[..templates]).unwrap(),
    }
  }

  #[test]
  fn grid_800_by_600_stride_32() {
    let generator = AnchorGridGenerator;
    let level = level(32, 3);
    let size = ImageSize::new(800, 600).unwrap();

    let grid = generator.generate(&level, size).unwrap();
    assert_eq!(grid.grid, GridShape { width: 25, height: 19 });
    assert_eq!(grid.len(), 1425);
    assert_eq!(generator.stats(&level, size).unwrap().total, 1425);
  }

  #[test]
  fn count_matches_materialized_boxes() {
    let generator = AnchorGridGenerator;
    for (w, h) in [(1, 1), (31, 33), (640, 480), (801, 599), (1333, 800)] {
      let size = ImageSize::new(w, h).unwrap();
      for stride in [8, 16, 32, 64, 128] {
        for templates in 1..=4 {
          let level = level(stride, templates);
          let stats = generator.stats(&level, size).unwrap();
          let grid = generator.generate(&level, size).unwrap();
          assert_eq!(stats.grid.width * stats.grid.height * templates as u32, grid.len() as u32);
          assert_eq!(stats.total, grid.len());
        }
      }
    }
  }

  fn assert_within(grid: &AnchorGrid, size: ImageSize, slack: f32) {
    let max_w = grid.templates.iter().map(|t| t.width).fold(0.0, f32::max);
    let max_h = grid.templates.iter().map(|t| t.height).fold(0.0, f32::max);
    let eps = 1e-3;
    for b in &grid.boxes {
      assert!(b.min_x >= -max_w / 2.0 - eps);
      assert!(b.min_y >= -max_h / 2.0 - eps);
      assert!(b.max_x <= size.width as f32 + max_w / 2.0 + slack + eps);
      assert!(b.max_y <= size.height as f32 + max_h / 2.0 + slack + eps);
    }
  }

  #[test]
  fn boxes_stay_near_image_when_stride_divides() {
    let generator = AnchorGridGenerator;
    let levels = AnchorConfig::default().retinanet_levels().unwrap();
    let size = ImageSize::new(1024, 512).unwrap();
    for level in &levels {
      let grid = generator.generate(level, size).unwrap();
      assert_within(&grid, size, 0.0);
    }
  }

  #[test]
  fn ragged_edges_overshoot_by_at_most_half_stride() {
    let generator = AnchorGridGenerator;
    let levels = AnchorConfig::default().retinanet_levels().unwrap();
    let size = ImageSize::new(801, 599).unwrap();
    for level in &levels {
      let grid = generator.generate(level, size).unwrap();
      assert_within(&grid, size, level.stride as f32 / 2.0);
    }
  }

  #[test]
  fn cell_centers_and_template_order() {
    let generator = AnchorGridGenerator;
    let level = PyramidLevel {
      index: 3,
      stride: 10,
      channels: 1,
      templates: vec![
        AnchorTemplate { width: 4.0, height: 4.0 },
        AnchorTemplate { width: 8.0, height: 2.0 },
      ],
    };
    let grid = generator.generate(&level, ImageSize::new(20, 10).unwrap()).unwrap();
    assert_eq!(grid.len(), 4);
    assert_eq!(grid.boxes[0].center(), (5.0, 5.0));
    assert_eq!(grid.boxes[1], BoundingBox::new(1.0, 4.0, 9.0, 6.0).unwrap());
    assert_eq!(grid.boxes[2].center(), (15.0, 5.0));
    for (i, b) in grid.boxes.iter().enumerate() {
      assert_eq!(generator.anchor_at(&level, grid.grid, i), Some(*b));
    }
    assert_eq!(generator.anchor_at(&level, grid.grid, 4), None);
  }

  #[test]
  fn rejects_bad_geometry() {
    let generator = AnchorGridGenerator;
    let size = ImageSize { width: 0, height: 10 };
    assert!(matches!(
      generator.generate(&level(32, 3), size),
      Err(AnchorError::Geometry(GeometryError::EmptyImage { .. }))
    ));

    let size = ImageSize::new(10, 10).unwrap();
    assert_eq!(generator.generate(&level(0, 3), size).unwrap_err(), AnchorError::ZeroStride(5));
    assert_eq!(generator.stats(&level(8, 0), size).unwrap_err(), AnchorError::NoTemplates(5));
    assert!(AnchorTemplate::from_size_ratio(0.0, 1.0).is_err());
    assert!(AnchorTemplate::from_size_ratio(32.0, -1.0).is_err());
  }

  #[test]
  fn retinanet_defaults() {
    let config = AnchorConfig::default();
    let levels = config.retinanet_levels().unwrap();
    assert_eq!(levels.len(), 5);
    assert_eq!(levels[0].stride, 8);
    assert_eq!(levels[4].stride, 128);
    assert!(levels.iter().all(|l| l.templates.len() == 9));

    let square = config.templates_for(4).unwrap()[3];
    assert!((square.width - 64.0).abs() < 1e-4);
    assert!((square.height - 64.0).abs() < 1e-4);

    let tall = AnchorTemplate::from_size_ratio(32.0, 2.0).unwrap();
    assert!((tall.height / tall.width - 2.0).abs() < 1e-5);
    assert!((tall.width * tall.height - 1024.0).abs() < 1e-2);
  }

  #[test]
  fn pyramid_total_is_tens_of_thousands() {
    let generator = AnchorGridGenerator;
    let levels = AnchorConfig::default().retinanet_levels().unwrap();
    let stats = generator.pyramid_stats(&levels, ImageSize::new(1199, 800).unwrap()).unwrap();
    let total: usize = stats.iter().map(|s| s.total).sum();
    // P3: 150x100, P4: 75x50, P5: 38x25, P6: 19x13, P7: 10x7
    assert_eq!(total, 9 * (15000 + 3750 + 950 + 247 + 70));
  }
}
