// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/session.rs - 步骤状态机
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
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  artifact::ArtifactBundle,
  cache::{ArtifactCache, BundleStore, CacheError},
  input::{self, ImageIdentity, ImageSelection, ImageSource, InputError, LoadedImage},
  model::{InferenceOutput, Model, recognizable_labels},
  output::Render,
  task::{BuildTask, Task},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
  Welcome,
  FeatureExtraction,
  AnchorGeneration,
  PostProcessing,
  Reference,
}

impl Step {
  pub const ALL: [Step; 5] = [
    Step::Welcome,
    Step::FeatureExtraction,
    Step::AnchorGeneration,
    Step::PostProcessing,
    Step::Reference,
  ];

  pub fn title(&self) -> &'static str {
    match self {
      Step::Welcome => "Welcome",
      Step::FeatureExtraction => "Feature Extraction",
      Step::AnchorGeneration => "Anchor Box Generation",
      Step::PostProcessing => "Post Processing",
      Step::Reference => "Reference",
    }
  }

  /// 是否需要已绑定图像的产物包
  pub fn needs_bundle(&self) -> bool {
    matches!(
      self,
      Step::FeatureExtraction | Step::AnchorGeneration | Step::PostProcessing
    )
  }
}

impl std::fmt::Display for Step {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.title())
  }
}

impl FromStr for Step {
  type Err = SessionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "welcome" => Ok(Step::Welcome),
      "features" | "feature-extraction" | "fpn" => Ok(Step::FeatureExtraction),
      "anchors" | "anchor-generation" | "rpn" => Ok(Step::AnchorGeneration),
      "nms" | "post-processing" => Ok(Step::PostProcessing),
      "reference" | "references" => Ok(Step::Reference),
      _ => Err(SessionError::UnknownStep(s.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
  pub topic: &'static str,
  pub url: &'static str,
}

pub const REFERENCES: [Reference; 11] = [
  Reference {
    topic: "FPN",
    url: "https://blog.zenggyu.com/en/post/2018-12-05/retinanet-explained-and-demystified/",
  },
  Reference {
    topic: "FPN",
    url: "https://towardsdatascience.com/review-fpn-feature-pyramid-network-object-detection-262fc7482610",
  },
  Reference {
    topic: "FPN",
    url: "https://jonathan-hui.medium.com/understanding-feature-pyramid-networks-for-object-detection-fpn-45b227b9106c",
  },
  Reference {
    topic: "FPN",
    url: "https://www.jeremyjordan.me/object-detection-one-stage/",
  },
  Reference {
    topic: "FPN",
    url: "https://towardsdatascience.com/retinanet-how-focal-loss-fixes-single-shot-detection-cb320e3bb0de",
  },
  Reference {
    topic: "RPN",
    url: "https://tryolabs.com/blog/2018/01/18/faster-r-cnn-down-the-rabbit-hole-of-modern-object-detection/",
  },
  Reference {
    topic: "RPN",
    url: "https://towardsdatascience.com/region-proposal-network-a-detailed-view-1305c7875853",
  },
  Reference {
    topic: "Faster R-CNN",
    url: "https://blog.paperspace.com/faster-r-cnn-explained-object-detection/",
  },
  Reference {
    topic: "Papers",
    url: "https://arxiv.org/pdf/1708.02002.pdf",
  },
  Reference {
    topic: "Papers",
    url: "https://arxiv.org/pdf/1612.03144.pdf",
  },
  Reference {
    topic: "Papers",
    url: "https://arxiv.org/pdf/1512.03385.pdf",
  },
];

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("进入 {0} 之前需要先选择图像")]
  NoImageSelected(Step),
  #[error("未知的步骤: {0}")]
  UnknownStep(String),
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("缓存错误: {0}")]
  Cache(#[from] CacheError),
}

/// 一个会话的全部状态，只由 [`StepOrchestrator`] 修改
#[derive(Debug, Clone)]
pub struct SessionState {
  source: Option<ImageSource>,
  step: Step,
  bundle: Option<Arc<ArtifactBundle>>,
}

impl Default for SessionState {
  fn default() -> Self {
    Self {
      source: None,
      step: Step::Welcome,
      bundle: None,
    }
  }
}

impl SessionState {
  pub fn step(&self) -> Step {
    self.step
  }

  pub fn identity(&self) -> Option<&ImageIdentity> {
    self.source.as_ref().map(|s| &s.identity)
  }

  pub fn source(&self) -> Option<&ImageSource> {
    self.source.as_ref()
  }

  pub fn bundle(&self) -> Option<&Arc<ArtifactBundle>> {
    self.bundle.as_ref()
  }
}

/// 交给展示层的只读视图
#[derive(Debug, Clone)]
pub enum StepView {
  Welcome {
    identity: Option<ImageIdentity>,
    presets: Vec<&'static str>,
  },
  FeatureExtraction(Arc<ArtifactBundle>),
  AnchorGeneration(Arc<ArtifactBundle>),
  PostProcessing {
    bundle: Arc<ArtifactBundle>,
    /// 过滤后没有任何检测结果
    no_detections: bool,
  },
  Reference(&'static [Reference]),
}

impl StepView {
  pub fn step(&self) -> Step {
    match self {
      StepView::Welcome { .. } => Step::Welcome,
      StepView::FeatureExtraction(_) => Step::FeatureExtraction,
      StepView::AnchorGeneration(_) => Step::AnchorGeneration,
      StepView::PostProcessing { .. } => Step::PostProcessing,
      StepView::Reference(_) => Step::Reference,
    }
  }
}

/// 没有检测结果时给用户的提示
pub fn no_detections_message() -> String {
  let labels: Vec<&str> = recognizable_labels().collect();
  format!(
    "没有检测到任何目标。请换一张包含以下类别的图像: {}",
    labels.join(", ")
  )
}

pub struct StepOrchestrator<S: BundleStore, M, R> {
  cache: Arc<ArtifactCache<S>>,
  task: BuildTask,
  model: M,
  render: R,
  preset_dir: PathBuf,
}

impl<S, M, R> StepOrchestrator<S, M, R>
where
  S: BundleStore,
  M: Model<Input = LoadedImage, Output = InferenceOutput>,
  M::Error: Display,
  R: Render,
  R::Error: Display,
{
  pub fn new(
    cache: Arc<ArtifactCache<S>>,
    task: BuildTask,
    model: M,
    render: R,
    preset_dir: impl Into<PathBuf>,
  ) -> Self {
    Self {
      cache,
      task,
      model,
      render,
      preset_dir: preset_dir.into(),
    }
  }

  pub fn cache(&self) -> &ArtifactCache<S> {
    &self.cache
  }

  /// 在欢迎页绑定图像。上传的图像先清除 `custom` 标识下的旧产物
  pub fn select_image(
    &self,
    state: &mut SessionState,
    selection: &ImageSelection,
  ) -> Result<StepView, SessionError> {
    let source = selection.resolve(&self.preset_dir)?;
    if source.uploaded {
      self.cache.invalidate(&source.identity)?;
    }

    let changed = state.identity() != Some(&source.identity);
    if changed || source.uploaded {
      if let Some(old) = state.identity() {
        debug!("会话图像由 {} 切换为 {}", old, source.identity);
      }
      state.bundle = None;
    }
    info!("绑定图像 {} ({})", source.identity, source.path.display());
    state.source = Some(source);
    state.step = Step::Welcome;
    Ok(self.welcome(state))
  }

  /// 进入任意步骤，需要时构建或读取产物包
  pub fn enter(&self, state: &mut SessionState, step: Step) -> Result<StepView, SessionError> {
    let view = match step {
      Step::Welcome => self.welcome(state),
      Step::Reference => StepView::Reference(&REFERENCES),
      Step::FeatureExtraction => StepView::FeatureExtraction(self.ensure_bundle(state, step)?),
      Step::AnchorGeneration => StepView::AnchorGeneration(self.ensure_bundle(state, step)?),
      Step::PostProcessing => {
        let bundle = self.ensure_bundle(state, step)?;
        let no_detections = !bundle.has_detections();
        StepView::PostProcessing {
          bundle,
          no_detections,
        }
      }
    };
    debug!("{} -> {}", state.step, step);
    state.step = step;
    Ok(view)
  }

  fn welcome(&self, state: &SessionState) -> StepView {
    StepView::Welcome {
      identity: state.identity().cloned(),
      presets: input::preset_names().collect(),
    }
  }

  fn ensure_bundle(
    &self,
    state: &mut SessionState,
    step: Step,
  ) -> Result<Arc<ArtifactBundle>, SessionError> {
    if let Some(bundle) = &state.bundle {
      return Ok(bundle.clone());
    }
    let source = state
      .source
      .as_ref()
      .ok_or(SessionError::NoImageSelected(step))?;
    let bundle = self.cache.get_or_build(&source.identity, || {
      self.task.run_task(source, &self.model, &self.render)
    })?;
    state.bundle = Some(bundle.clone());
    Ok(bundle)
  }
}
