// 该文件是 Detviz （检测可视化） 项目的一部分。
// tests/session_flow.rs - 步骤状态机的完整流程
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

mod common;

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use common::{CountingModel, write_image, write_presets};
use detviz::{
  cache::{ArtifactCache, BundleStore, DirectoryStore, MemoryStore},
  config::PipelineConfig,
  geometry::ImageSize,
  input::{ImageIdentity, ImageSelection},
  output::NoRender,
  session::{SessionError, SessionState, Step, StepOrchestrator, StepView},
};

fn orchestrator<S: BundleStore>(
  store: S,
  model: CountingModel,
  preset_dir: &Path,
) -> StepOrchestrator<S, CountingModel, NoRender> {
  StepOrchestrator::new(
    Arc::new(ArtifactCache::new(store)),
    PipelineConfig::default().build_task().unwrap(),
    model,
    NoRender,
    preset_dir,
  )
}

fn bundle_of(view: &StepView) -> Arc<detviz::artifact::ArtifactBundle> {
  match view {
    StepView::FeatureExtraction(b) | StepView::AnchorGeneration(b) => b.clone(),
    StepView::PostProcessing { bundle, .. } => bundle.clone(),
    other => panic!("unexpected view {:?}", other.step()),
  }
}

#[test]
fn steps_compute_once_per_identity() {
  let presets = tempdir().unwrap();
  write_presets(presets.path());
  let model = CountingModel::default();
  let orch = orchestrator(MemoryStore::default(), model.clone(), presets.path());
  let mut state = SessionState::default();

  orch
    .select_image(&mut state, &ImageSelection::Preset("giraffe".into()))
    .unwrap();
  for step in [
    Step::FeatureExtraction,
    Step::AnchorGeneration,
    Step::PostProcessing,
    Step::Reference,
    Step::Welcome,
    Step::AnchorGeneration,
  ] {
    let view = orch.enter(&mut state, step).unwrap();
    assert_eq!(view.step(), step);
    assert_eq!(state.step(), step);
  }
  assert_eq!(model.calls(), 1);

  let view = orch.enter(&mut state, Step::PostProcessing).unwrap();
  let StepView::PostProcessing {
    bundle,
    no_detections,
  } = view
  else {
    panic!("expected post processing view");
  };
  assert!(!no_detections);
  // 两个重叠的同类框只保留高分者
  assert_eq!(bundle.detections.pre_nms.len(), 3);
  assert_eq!(bundle.detections.kept.len(), 2);
  assert_eq!(bundle.detections.dropped.len(), 1);
}

#[test]
fn switching_presets_rebinds_and_revisiting_uses_cache() {
  let presets = tempdir().unwrap();
  write_presets(presets.path());
  let model = CountingModel::default();
  let orch = orchestrator(MemoryStore::default(), model.clone(), presets.path());
  let mut state = SessionState::default();

  orch
    .select_image(&mut state, &ImageSelection::Preset("giraffe".into()))
    .unwrap();
  let giraffe = bundle_of(&orch.enter(&mut state, Step::FeatureExtraction).unwrap());

  orch
    .select_image(&mut state, &ImageSelection::Preset("soccer".into()))
    .unwrap();
  assert!(state.bundle().is_none());
  let soccer = bundle_of(&orch.enter(&mut state, Step::FeatureExtraction).unwrap());
  assert_eq!(soccer.identity.as_str(), "soccer");

  orch
    .select_image(&mut state, &ImageSelection::Preset("giraffe".into()))
    .unwrap();
  let again = bundle_of(&orch.enter(&mut state, Step::AnchorGeneration).unwrap());
  assert!(Arc::ptr_eq(&giraffe, &again));
  assert_eq!(model.calls(), 2);
}

#[test]
fn compute_steps_need_an_image() {
  let presets = tempdir().unwrap();
  let orch = orchestrator(MemoryStore::default(), CountingModel::default(), presets.path());
  let mut state = SessionState::default();

  assert!(matches!(
    orch.enter(&mut state, Step::AnchorGeneration),
    Err(SessionError::NoImageSelected(Step::AnchorGeneration))
  ));
  assert_eq!(state.step(), Step::Welcome);
  assert!(matches!(
    orch.enter(&mut state, Step::Reference).unwrap(),
    StepView::Reference(refs) if !refs.is_empty()
  ));
}

#[test]
fn empty_detections_are_surfaced() {
  let presets = tempdir().unwrap();
  write_presets(presets.path());
  let model = CountingModel {
    empty: true,
    ..Default::default()
  };
  let orch = orchestrator(MemoryStore::default(), model, presets.path());
  let mut state = SessionState::default();

  orch
    .select_image(&mut state, &ImageSelection::Preset("snowboard".into()))
    .unwrap();
  match orch.enter(&mut state, Step::PostProcessing).unwrap() {
    StepView::PostProcessing {
      bundle,
      no_detections,
    } => {
      assert!(no_detections);
      assert!(bundle.detections.kept.is_empty());
      assert!(bundle.total_anchors > 0);
    }
    other => panic!("unexpected view {:?}", other.step()),
  }
}

#[test]
fn new_upload_never_returns_previous_custom_bundle() {
  let uploads = tempdir().unwrap();
  let data = tempdir().unwrap();
  let model = CountingModel::default();
  let store = DirectoryStore::open(data.path()).unwrap();
  let orch = orchestrator(store.clone(), model.clone(), uploads.path());
  let mut state = SessionState::default();

  let first = write_image(&uploads.path().join("cat.png"), 64, 48);
  orch
    .select_image(&mut state, &ImageSelection::Upload(first))
    .unwrap();
  let old = bundle_of(&orch.enter(&mut state, Step::PostProcessing).unwrap());
  assert_eq!(old.image_size, ImageSize::new(64, 48).unwrap());

  let second = write_image(&uploads.path().join("dog.png"), 40, 30);
  orch
    .select_image(&mut state, &ImageSelection::Upload(second))
    .unwrap();
  let new = bundle_of(&orch.enter(&mut state, Step::PostProcessing).unwrap());

  assert_eq!(new.identity, ImageIdentity::custom());
  assert_eq!(new.image_size, ImageSize::new(40, 30).unwrap());
  assert_ne!(new.anchors, old.anchors);
  assert_ne!(new.feature_samples, old.feature_samples);
  assert_eq!(model.calls(), 2);

  let persisted = store.load(&ImageIdentity::custom()).unwrap().unwrap();
  assert_eq!(persisted, *new);
}

#[test]
fn unknown_preset_is_rejected() {
  let presets = tempdir().unwrap();
  let orch = orchestrator(MemoryStore::default(), CountingModel::default(), presets.path());
  let mut state = SessionState::default();
  assert!(matches!(
    orch.select_image(&mut state, &ImageSelection::Preset("zebra".into())),
    Err(SessionError::Input(_))
  ));
  assert!(state.identity().is_none());
}
