// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/config.rs - 流水线配置
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
use tracing::info;

use crate::{
  anchor::AnchorConfig,
  artifact::{ArtifactBuilder, SamplingConfig},
  filter::{DetectionFilter, FilterConfig, FilterError},
  task::BuildTask,
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("解析配置文件 {path} 失败: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("过滤参数无效: {0}")]
  Filter(#[from] FilterError),
}

/// JSON 配置文件，缺省字段取默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub filter: FilterConfig,
  pub anchors: AnchorConfig,
  pub sampling: SamplingConfig,
  pub cache_dir: PathBuf,
  pub preset_dir: PathBuf,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      filter: FilterConfig::default(),
      anchors: AnchorConfig::default(),
      sampling: SamplingConfig::default(),
      cache_dir: PathBuf::from("data"),
      preset_dir: PathBuf::from("images"),
    }
  }
}

impl PipelineConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Self = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.filter.validate()?;
    info!("已加载配置: {}", path.display());
    Ok(config)
  }

  pub fn build_task(&self) -> Result<BuildTask, ConfigError> {
    Ok(BuildTask::new(
      DetectionFilter::new(self.filter)?,
      ArtifactBuilder::new(self.anchors.clone(), self.sampling.clone()),
    ))
  }
}
