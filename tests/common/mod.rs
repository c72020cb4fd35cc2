// 该文件是 Detviz （检测可视化） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的模拟引擎与图像
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

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{Rgb, RgbImage};

use detviz::{
  filter::DetectionCandidate,
  geometry::BoundingBox,
  input::LoadedImage,
  model::{FeatureMap, InferenceOutput, LevelOutput, Model},
};

/// 记录调用次数的推理引擎，输出只依赖图像尺寸
#[derive(Clone, Default)]
pub struct CountingModel {
  pub calls: Arc<AtomicUsize>,
  /// 前若干次调用返回错误
  pub fail_first: usize,
  pub empty: bool,
}

impl CountingModel {
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Model for CountingModel {
  type Input = LoadedImage;
  type Output = InferenceOutput;
  type Error = std::io::Error;

  fn infer(&self, input: &LoadedImage) -> Result<InferenceOutput, std::io::Error> {
    let n = self.calls.fetch_add(1, Ordering::SeqCst);
    if n < self.fail_first {
      return Err(std::io::Error::other("engine unavailable"));
    }
    Ok(fake_output(input, self.empty))
  }
}

pub fn fake_output(input: &LoadedImage, empty: bool) -> InferenceOutput {
  let size = input.size();
  let levels = [3u8, 4]
    .iter()
    .map(|&level| {
      let stride = 1u32 << level;
      let (w, h) = (size.width.div_ceil(stride), size.height.div_ceil(stride));
      let channels = 8;
      let candidates = if empty || level != 3 {
        vec![]
      } else {
        let w = size.width as f32;
        let h = size.height as f32;
        vec![
          DetectionCandidate {
            bbox: BoundingBox::new(0.0, 0.0, w / 2.0, h / 2.0).unwrap(),
            score: 0.9,
            label: 25,
          },
          DetectionCandidate {
            bbox: BoundingBox::new(1.0, 0.0, w / 2.0, h / 2.0).unwrap(),
            score: 0.6,
            label: 25,
          },
          DetectionCandidate {
            bbox: BoundingBox::new(w / 2.0, h / 2.0, w, h).unwrap(),
            score: 0.3,
            label: 1,
          },
        ]
      };
      LevelOutput {
        level,
        stride,
        feature_map: FeatureMap {
          channels,
          height: h,
          width: w,
          data: (0..channels * w * h).map(|v| v as f32).collect(),
        },
        candidates,
      }
    })
    .collect();
  InferenceOutput {
    image_size: size,
    levels,
  }
}

pub fn write_image(path: &Path, width: u32, height: u32) -> PathBuf {
  RgbImage::from_pixel(width, height, Rgb([120, 80, 40]))
    .save(path)
    .unwrap();
  path.to_path_buf()
}

/// 在目录中放置全部预置图像
pub fn write_presets(dir: &Path) {
  for (_, file) in detviz::input::PRESET_IMAGES {
    write_image(&dir.join(file), 64, 48);
  }
}
