// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/main.rs - 逐步演示检测流程
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

mod args;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use detviz::{
  FromUrl,
  artifact::ArtifactBundle,
  cache::{ArtifactCache, BundleStore, DirectoryStore, MemoryStore},
  config::PipelineConfig,
  input::ImageSelection,
  model::{ReplayModel, ReplayModelBuilder, label_name},
  session::{SessionState, StepOrchestrator, StepView, no_detections_message},
};

#[cfg(feature = "render_assets")]
type Renderer = detviz::output::PngRender;
#[cfg(not(feature = "render_assets"))]
type Renderer = detviz::output::NoRender;

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();

  let mut config = match &args.config {
    Some(path) => PipelineConfig::load(path).context("加载配置文件失败")?,
    None => PipelineConfig::default(),
  };
  if let Some(v) = args.confidence {
    config.filter.confidence_threshold = v;
  }
  if let Some(v) = args.top_k {
    config.filter.top_k_per_level = v;
  }
  if let Some(v) = args.iou {
    config.filter.iou_threshold = v;
  }
  if let Some(dir) = &args.cache_dir {
    config.cache_dir = dir.clone();
  }
  if let Some(dir) = &args.preset_dir {
    config.preset_dir = dir.clone();
  }

  info!("推理引擎: {}", args.engine);
  info!("图像: {}", args.image);
  info!(
    "置信度阈值: {}, 每层 top-k: {}, NMS 阈值: {}",
    config.filter.confidence_threshold, config.filter.top_k_per_level, config.filter.iou_threshold
  );

  let model = ReplayModelBuilder::from_url(&args.engine)
    .and_then(ReplayModelBuilder::build)
    .context("创建推理引擎失败")?;
  let selection = ImageSelection::from_url(&args.image).context("无法解析图像选择")?;

  if args.no_persist {
    run(MemoryStore::default(), None, model, &config, &selection, &args)
  } else {
    let store = DirectoryStore::open(&config.cache_dir).context("打开缓存目录失败")?;
    let root = store.root().to_path_buf();
    run(store, Some(root), model, &config, &selection, &args)
  }
}

fn run<S: BundleStore>(
  store: S,
  asset_root: Option<PathBuf>,
  model: ReplayModel,
  config: &PipelineConfig,
  selection: &ImageSelection,
  args: &args::Args,
) -> Result<()> {
  let cache = Arc::new(ArtifactCache::new(store));
  let orchestrator = StepOrchestrator::new(
    cache,
    config.build_task()?,
    model,
    Renderer::default(),
    config.preset_dir.clone(),
  );

  let mut state = SessionState::default();
  let view = orchestrator
    .select_image(&mut state, selection)
    .context("选择图像失败")?;
  report(&view, asset_root.as_deref());

  for &step in &args.steps {
    let view = orchestrator
      .enter(&mut state, step)
      .with_context(|| format!("进入步骤 {} 失败", step))?;
    report(&view, asset_root.as_deref());
  }

  Ok(())
}

fn asset(bundle: &ArtifactBundle, root: Option<&Path>, relative: &Path) -> String {
  match root {
    Some(root) => root
      .join(bundle.identity.as_str())
      .join(relative)
      .display()
      .to_string(),
    None => relative.display().to_string(),
  }
}

fn report(view: &StepView, root: Option<&Path>) {
  println!();
  println!("== {} ==", view.step());
  match view {
    StepView::Welcome { identity, presets } => {
      println!("预置图像: {}", presets.join(", "));
      if let Some(identity) = identity {
        println!("当前图像: {}", identity);
      }
    }
    StepView::FeatureExtraction(bundle) => {
      for fs in &bundle.feature_samples {
        println!(
          "P{} (步长 {}): {}x{}, {} 个通道，抽样 {:?}",
          fs.level, fs.stride, fs.width, fs.height, fs.total_channels, fs.channels
        );
      }
      if let Some(path) = &bundle.assets.feature_maps {
        println!("特征图: {}", asset(bundle, root, path));
      }
    }
    StepView::AnchorGeneration(bundle) => {
      for level in &bundle.anchors {
        let s = &level.stats;
        println!(
          "P{} (步长 {}): 网格 {}x{} x {} 个模板 = {} 个锚框，显示 {} 个",
          s.level,
          s.stride,
          s.grid.width,
          s.grid.height,
          s.templates,
          s.total,
          level.sample.len()
        );
        if let Some(path) = bundle.assets.anchors.get(&format!("P{}", s.level)) {
          println!("  {}", asset(bundle, root, path));
        }
      }
      println!("锚框总数: {}", bundle.total_anchors);
    }
    StepView::PostProcessing {
      bundle,
      no_detections,
    } => {
      let stats = &bundle.detections.stats;
      println!(
        "锚框总数 {}，候选 {}，低于阈值 {}，top-k 截断 {}，NMS 前 {}，NMS 抑制 {}，保留 {}",
        bundle.total_anchors,
        stats.raw,
        stats.below_threshold,
        stats.truncated,
        bundle.detections.pre_nms.len(),
        stats.suppressed,
        stats.kept
      );
      if *no_detections {
        println!("{}", no_detections_message());
      }
      for d in &bundle.detections.kept {
        let b = &d.bbox;
        println!(
          "  - {}: {:.2}% at ({:.0}, {:.0}, {:.0}, {:.0}) [P{}]",
          label_name(d.label),
          d.score * 100.0,
          b.min_x,
          b.min_y,
          b.max_x,
          b.max_y,
          d.level
        );
      }
      for path in bundle.assets.without_nms.iter().chain(bundle.assets.with_nms.iter()) {
        println!("{}", asset(bundle, root, path));
      }
    }
    StepView::Reference(references) => {
      for r in references.iter() {
        println!("[{}] {}", r.topic, r.url);
      }
    }
  }
}
