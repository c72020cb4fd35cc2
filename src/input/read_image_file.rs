// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/input/read_image_file.rs - 图像文件读取
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

use std::path::Path;

use image::{ImageReader, RgbImage};
use tracing::debug;

use super::InputError;
use crate::geometry::ImageSize;

/// 解码后的 RGB 图像及其名称（文件名去掉扩展名）
#[derive(Debug, Clone)]
pub struct LoadedImage {
  pub name: String,
  pub pixels: RgbImage,
}

impl LoadedImage {
  pub fn size(&self) -> ImageSize {
    ImageSize {
      width: self.pixels.width(),
      height: self.pixels.height(),
    }
  }
}

pub fn read_image_file(path: &Path) -> Result<LoadedImage, InputError> {
  let pixels = ImageReader::open(path)?
    .with_guessed_format()?
    .decode()?
    .to_rgb8();
  ImageSize::new(pixels.width(), pixels.height())?;

  let name = path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default();
  debug!("读取图像 {}: {}x{}", path.display(), pixels.width(), pixels.height());

  Ok(LoadedImage { name, pixels })
}
