// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/model/replay.rs - 回放推理引擎
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, url_file_path,
  input::LoadedImage,
  model::{InferenceError, InferenceOutput, Model},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("模型路径必须使用 {0} 方案")]
  SchemeMismatch(String),
  #[error("回放目录路径编码无效: {0}")]
  InvalidPath(String),
  #[error("回放目录不存在: {0}")]
  MissingDirectory(PathBuf),
  #[error("读取回放文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("解析回放文件 {path} 失败: {source}")]
  Decode {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("回放输出无效: {0}")]
  Invalid(#[from] InferenceError),
}

/// 从目录中读取预先录制的推理结果，`<目录>/<图像名>.json`
pub struct ReplayModelBuilder {
  directory: PathBuf,
}

impl FromUrlWithScheme for ReplayModelBuilder {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayModelBuilder {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayError::SchemeMismatch(Self::SCHEME.to_string()));
    }

    let directory =
      url_file_path(url).map_err(|_| ReplayError::InvalidPath(url.path().to_string()))?;
    Ok(ReplayModelBuilder { directory })
  }
}

impl ReplayModelBuilder {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  pub fn build(self) -> Result<ReplayModel, ReplayError> {
    if !self.directory.is_dir() {
      return Err(ReplayError::MissingDirectory(self.directory));
    }
    info!("回放推理目录: {}", self.directory.display());
    Ok(ReplayModel {
      directory: self.directory,
    })
  }
}

pub struct ReplayModel {
  directory: PathBuf,
}

impl Model for ReplayModel {
  type Input = LoadedImage;
  type Output = InferenceOutput;
  type Error = ReplayError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let path = self.directory.join(format!("{}.json", input.name));
    debug!("读取回放文件: {}", path.display());

    let raw = std::fs::read(&path).map_err(|source| ReplayError::Io {
      path: path.clone(),
      source,
    })?;
    let output: InferenceOutput =
      serde_json::from_slice(&raw).map_err(|source| ReplayError::Decode {
        path: path.clone(),
        source,
      })?;

    output.validate()?;
    if output.image_size != input.size() {
      return Err(InferenceError::SizeMismatch {
        expected: input.size(),
        actual: output.image_size,
      }
      .into());
    }

    debug!(
      "回放输出: {} 层, {} 个候选框",
      output.levels.len(),
      output.candidate_count()
    );
    Ok(output)
  }
}
