// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/geometry.rs - 边界框几何
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

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
  #[error("边界框坐标非有限值: {0:?}")]
  NonFinite([f32; 4]),
  #[error("边界框坐标倒置 (max < min): {0:?}")]
  Inverted([f32; 4]),
  #[error("图像尺寸必须为正整数, 实际为 {width}x{height}")]
  EmptyImage { width: u32, height: u32 },
}

/// 图像尺寸（像素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
  pub width: u32,
  pub height: u32,
}

impl ImageSize {
  pub fn new(width: u32, height: u32) -> Result<Self, GeometryError> {
    if width == 0 || height == 0 {
      return Err(GeometryError::EmptyImage { width, height });
    }
    Ok(Self { width, height })
  }
}

impl std::fmt::Display for ImageSize {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

/// 像素坐标系下的边界框 [x_min, y_min, x_max, y_max]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
  pub min_x: f32,
  pub min_y: f32,
  pub max_x: f32,
  pub max_y: f32,
}

impl BoundingBox {
  pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Result<Self, GeometryError> {
    let coords = [min_x, min_y, max_x, max_y];
    if coords.iter().any(|v| !v.is_finite()) {
      return Err(GeometryError::NonFinite(coords));
    }
    if max_x < min_x || max_y < min_y {
      return Err(GeometryError::Inverted(coords));
    }
    Ok(Self {
      min_x,
      min_y,
      max_x,
      max_y,
    })
  }

  /// 以 (cx, cy) 为中心、宽高为 (w, h) 的边界框；调用方保证 w, h 非负
  pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self {
      min_x: cx - w / 2.0,
      min_y: cy - h / 2.0,
      max_x: cx + w / 2.0,
      max_y: cy + h / 2.0,
    }
  }

  pub fn width(&self) -> f32 {
    self.max_x - self.min_x
  }

  pub fn height(&self) -> f32 {
    self.max_y - self.min_y
  }

  pub fn center(&self) -> (f32, f32) {
    (
      (self.min_x + self.max_x) / 2.0,
      (self.min_y + self.max_y) / 2.0,
    )
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn is_degenerate(&self) -> bool {
    self.area() <= 0.0
  }

  /// 交并比。无重叠为 0，完全相同为 1；退化框只与完全相同的退化框得 1
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    if self == other {
      return 1.0;
    }
    if self.is_degenerate() || other.is_degenerate() {
      return 0.0;
    }

    let x1 = self.min_x.max(other.min_x);
    let y1 = self.min_y.max(other.min_y);
    let x2 = self.max_x.min(other.max_x);
    let y2 = self.max_y.min(other.max_y);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if intersection <= 0.0 {
      return 0.0;
    }
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

impl TryFrom<[f32; 4]> for BoundingBox {
  type Error = GeometryError;

  fn try_from(coords: [f32; 4]) -> Result<Self, Self::Error> {
    BoundingBox::new(coords[0], coords[1], coords[2], coords[3])
  }
}

impl From<BoundingBox> for [f32; 4] {
  fn from(bbox: BoundingBox) -> Self {
    [bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y]
  }
}
