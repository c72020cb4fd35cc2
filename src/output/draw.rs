// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/output/draw.rs - 特征图、锚框与检测结果可视化
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

use std::io::Cursor;
use std::path::PathBuf;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, imageops};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;
use tracing::debug;

use crate::{
  artifact::{ArtifactBundle, FeatureSample, PendingBundle, SideFile},
  filter::Detection,
  geometry::BoundingBox,
  model::COCO_LABELS,
  output::Render,
};

const TILE_WIDTH: u32 = 128;
const TILE_HEIGHT: u32 = 96;
const TILE_GAP: u32 = 4;
const BOX_THICKNESS: i32 = 2;
const ANCHOR_COLOR: [u8; 3] = [255, 64, 64];
const PALETTE_SEED: u64 = 24;

#[derive(Error, Debug)]
pub enum RenderError {
  #[error("图像编码错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// 渲染为 PNG：`fpn/feature_maps.png`、`rpn/P{n}.png`、`nms/{without,with}_nms.png`
pub struct PngRender {
  palette: Vec<[u8; 3]>,
}

impl Default for PngRender {
  fn default() -> Self {
    // 每个类别一个固定颜色
    let mut rng = StdRng::seed_from_u64(PALETTE_SEED);
    let palette = (0..COCO_LABELS.len())
      .map(|_| [rng.random(), rng.random(), rng.random()])
      .collect();
    Self { palette }
  }
}

impl PngRender {
  fn color(&self, label: u32) -> [u8; 3] {
    self.palette[label as usize % self.palette.len()]
  }

  // 在图像上绘制一个加粗的矩形边框
  fn draw_bbox(&self, image: &mut RgbImage, bbox: &BoundingBox, color: [u8; 3]) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
      return;
    }
    // 先在浮点域裁剪到图像内，再转为像素坐标
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;
    let x_min = bbox.min_x.floor().clamp(0.0, max_x) as i32;
    let y_min = bbox.min_y.floor().clamp(0.0, max_y) as i32;
    let x_max = (bbox.max_x.ceil() - 1.0).clamp(0.0, max_x) as i32;
    let y_max = (bbox.max_y.ceil() - 1.0).clamp(0.0, max_y) as i32;

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for thickness in 0..BOX_THICKNESS {
      let (x0, y0) = (x_min + thickness, y_min + thickness);
      let (x1, y1) = (x_max - thickness, y_max - thickness);
      if x0 > x1 || y0 > y1 {
        break;
      }
      let rect = Rect::at(x0, y0).of_size((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
      draw_hollow_rect_mut(image, rect, Rgb(color));
    }
  }

  fn draw_detections(&self, image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    for d in detections {
      self.draw_bbox(&mut canvas, &d.bbox, self.color(d.label));
    }
    canvas
  }

  fn draw_anchors(&self, image: &RgbImage, anchors: &[BoundingBox]) -> RgbImage {
    let mut canvas = image.clone();
    for a in anchors {
      self.draw_bbox(&mut canvas, a, ANCHOR_COLOR);
    }
    canvas
  }

  /// 行为抽样通道、列为金字塔层的灰度拼图
  fn draw_feature_maps(&self, samples: &[FeatureSample]) -> RgbImage {
    let columns = samples.len().max(1) as u32;
    let rows = samples.iter().map(|s| s.maps.len()).max().unwrap_or(0).max(1) as u32;
    let width = columns * (TILE_WIDTH + TILE_GAP) + TILE_GAP;
    let height = rows * (TILE_HEIGHT + TILE_GAP) + TILE_GAP;
    let mut mosaic = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));

    for (col, sample) in samples.iter().enumerate() {
      for (row, plane) in sample.maps.iter().enumerate() {
        let Some(tile) = heatmap(plane, sample.width, sample.height) else {
          continue;
        };
        let tile = imageops::resize(&tile, TILE_WIDTH, TILE_HEIGHT, imageops::FilterType::Nearest);
        let x = TILE_GAP + col as u32 * (TILE_WIDTH + TILE_GAP);
        let y = TILE_GAP + row as u32 * (TILE_HEIGHT + TILE_GAP);
        imageops::replace(&mut mosaic, &tile, i64::from(x), i64::from(y));
      }
    }
    mosaic
  }
}

/// 按最小/最大值归一化到灰度
fn heatmap(plane: &[f32], width: u32, height: u32) -> Option<RgbImage> {
  if width == 0 || height == 0 || plane.len() != (width * height) as usize {
    return None;
  }
  let (lo, hi) = plane
    .iter()
    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
  let span = if hi > lo { hi - lo } else { 1.0 };
  Some(RgbImage::from_fn(width, height, |x, y| {
    let v = plane[(y * width + x) as usize];
    let g = (((v - lo) / span) * 255.0).round() as u8;
    Rgb([g, g, g])
  }))
}

fn encode_png(image: RgbImage) -> Result<Vec<u8>, RenderError> {
  let mut bytes = Vec::new();
  DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
  Ok(bytes)
}

impl Render for PngRender {
  type Error = RenderError;

  fn render_result(
    &self,
    image: &RgbImage,
    mut bundle: ArtifactBundle,
  ) -> Result<PendingBundle, Self::Error> {
    let mut side_files = Vec::new();
    let mut push = |path: PathBuf, canvas: RgbImage| -> Result<PathBuf, RenderError> {
      side_files.push(SideFile {
        relative_path: path.clone(),
        bytes: encode_png(canvas)?,
      });
      Ok(path)
    };

    bundle.assets.feature_maps = Some(push(
      PathBuf::from("fpn").join("feature_maps.png"),
      self.draw_feature_maps(&bundle.feature_samples),
    )?);

    for level in &bundle.anchors {
      let name = format!("P{}", level.stats.level);
      let path = push(
        PathBuf::from("rpn").join(format!("{name}.png")),
        self.draw_anchors(image, &level.sample),
      )?;
      bundle.assets.anchors.insert(name, path);
    }

    bundle.assets.without_nms = Some(push(
      PathBuf::from("nms").join("without_nms.png"),
      self.draw_detections(image, &bundle.detections.pre_nms),
    )?);
    bundle.assets.with_nms = Some(push(
      PathBuf::from("nms").join("with_nms.png"),
      self.draw_detections(image, &bundle.detections.kept),
    )?);

    debug!("{}: 渲染 {} 个文件", bundle.identity, side_files.len());
    Ok(PendingBundle { bundle, side_files })
  }
}
