// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/input.rs - 图像选择与图像标识
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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, url_file_path};
use crate::geometry::GeometryError;

mod read_image_file;
pub use self::read_image_file::{LoadedImage, read_image_file};

const PRESET_SCHEME: &str = "preset";
const UPLOAD_SCHEME: &str = "image";
const IDENTITY_MAX_LEN: usize = 64;

/// 预置图像：(名称, 预置目录下的文件名)
pub const PRESET_IMAGES: [(&str, &str); 3] = [
  ("giraffe", "giraffe.jpg"),
  ("soccer", "soccer_img.jpg"),
  ("snowboard", "snowboard.jpg"),
];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("未知的预置图像: {0}")]
  UnknownPreset(String),
  #[error("无效的图像标识: {0:?}")]
  InvalidIdentity(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("图像路径编码无效: {0}")]
  InvalidPath(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("图像尺寸错误: {0}")]
  Geometry(#[from] GeometryError),
}

/// 图像标识，决定一个缓存槽位及其持久化目录
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageIdentity(String);

impl ImageIdentity {
  /// 上传图像共用的标识
  pub const CUSTOM: &'static str = "custom";

  /// 只允许小写字母、数字、`_` 与 `-`，以便直接作为目录名
  pub fn new(name: impl Into<String>) -> Result<Self, InputError> {
    let name = name.into();
    let valid = !name.is_empty()
      && name.len() <= IDENTITY_MAX_LEN
      && name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
      return Err(InputError::InvalidIdentity(name));
    }
    Ok(Self(name))
  }

  pub fn custom() -> Self {
    Self(Self::CUSTOM.to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_custom(&self) -> bool {
    self.0 == Self::CUSTOM
  }
}

impl std::fmt::Display for ImageIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl TryFrom<String> for ImageIdentity {
  type Error = InputError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    ImageIdentity::new(value)
  }
}

impl From<ImageIdentity> for String {
  fn from(identity: ImageIdentity) -> Self {
    identity.0
  }
}

/// 用户在欢迎页的选择
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelection {
  Preset(String),
  Upload(PathBuf),
}

impl FromUrl for ImageSelection {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      PRESET_SCHEME => {
        let name = url.host_str().unwrap_or_default().to_lowercase();
        Ok(ImageSelection::Preset(name))
      }
      UPLOAD_SCHEME => url_file_path(url)
        .map(ImageSelection::Upload)
        .map_err(|_| InputError::InvalidPath(url.path().to_string())),
      other => {
        error!(
          "URI 方案不匹配: 期望 '{}' 或 '{}', 实际 '{}'",
          PRESET_SCHEME, UPLOAD_SCHEME, other
        );
        Err(InputError::SchemeMismatch(other.to_string()))
      }
    }
  }
}

impl ImageSelection {
  pub fn identity(&self) -> Result<ImageIdentity, InputError> {
    match self {
      ImageSelection::Preset(name) => {
        preset_file(name)?;
        ImageIdentity::new(name.as_str())
      }
      ImageSelection::Upload(_) => Ok(ImageIdentity::custom()),
    }
  }

  /// 解析为具体的图像文件
  pub fn resolve(&self, preset_dir: &Path) -> Result<ImageSource, InputError> {
    let identity = self.identity()?;
    match self {
      ImageSelection::Preset(name) => Ok(ImageSource {
        identity,
        path: preset_dir.join(preset_file(name)?),
        uploaded: false,
      }),
      ImageSelection::Upload(path) => Ok(ImageSource {
        identity,
        path: path.clone(),
        uploaded: true,
      }),
    }
  }
}

fn preset_file(name: &str) -> Result<&'static str, InputError> {
  PRESET_IMAGES
    .iter()
    .find(|(preset, _)| *preset == name)
    .map(|(_, file)| *file)
    .ok_or_else(|| InputError::UnknownPreset(name.to_string()))
}

pub fn preset_names() -> impl Iterator<Item = &'static str> {
  PRESET_IMAGES.iter().map(|(name, _)| *name)
}

/// 已绑定标识的图像文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
  pub identity: ImageIdentity,
  pub path: PathBuf,
  pub uploaded: bool,
}

impl ImageSource {
  pub fn load(&self) -> Result<LoadedImage, InputError> {
    read_image_file(&self.path)
  }
}
