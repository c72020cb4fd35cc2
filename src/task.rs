// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/task.rs - 单张图像的产物构建任务
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

use std::fmt::Display;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::{
  anchor::AnchorError,
  artifact::{ArtifactBuilder, PendingBundle},
  filter::DetectionFilter,
  input::{ImageSource, InputError, LoadedImage},
  model::{InferenceError, InferenceOutput, Model},
  output::Render,
};

#[derive(Error, Debug)]
pub enum BuildError {
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("推理失败: {0}")]
  Inference(String),
  #[error("推理输出无效: {0}")]
  InvalidOutput(#[from] InferenceError),
  #[error("锚框生成失败: {0}")]
  Anchor(#[from] AnchorError),
  #[error("渲染失败: {0}")]
  Render(String),
}

pub trait Task<I, M, O> {
  type Output;
  type Error;
  fn run_task(&self, input: I, model: &M, output: &O) -> Result<Self::Output, Self::Error>;
}

/// 读取图像、推理、过滤、组装并渲染，得到待提交的产物包
#[derive(Debug, Clone)]
pub struct BuildTask {
  filter: DetectionFilter,
  builder: ArtifactBuilder,
}

impl BuildTask {
  pub fn new(filter: DetectionFilter, builder: ArtifactBuilder) -> Self {
    Self { filter, builder }
  }

  pub fn filter(&self) -> &DetectionFilter {
    &self.filter
  }
}

impl<'s, M, O> Task<&'s ImageSource, M, O> for BuildTask
where
  M: Model<Input = LoadedImage, Output = InferenceOutput>,
  M::Error: Display,
  O: Render,
  O::Error: Display,
{
  type Output = PendingBundle;
  type Error = BuildError;

  fn run_task(
    &self,
    source: &'s ImageSource,
    model: &M,
    output: &O,
  ) -> Result<PendingBundle, BuildError> {
    info!("开始构建 {} ({})", source.identity, source.path.display());
    let image = source.load()?;

    let now = Instant::now();
    let result = model
      .infer(&image)
      .map_err(|e| BuildError::Inference(e.to_string()))?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    result.validate()?;
    if result.image_size != image.size() {
      return Err(
        InferenceError::SizeMismatch {
          expected: image.size(),
          actual: result.image_size,
        }
        .into(),
      );
    }

    let detections = self
      .filter
      .filter(result.levels.iter().map(|l| (l.level, l.candidates.as_slice())));
    if detections.kept.is_empty() {
      warn!("{}: 没有检测到任何目标", source.identity);
    }

    let bundle = self
      .builder
      .build(source.identity.clone(), &result, detections)?;

    let now = Instant::now();
    let pending = output
      .render_result(&image.pixels, bundle)
      .map_err(|e| BuildError::Render(e.to_string()))?;
    info!(
      "渲染完成，耗时: {:.2?}，{} 个文件",
      now.elapsed(),
      pending.side_files.len()
    );

    Ok(pending)
  }
}
