// 该文件是 Detviz （检测可视化） 项目的一部分。
// tests/cache_store.rs - 缓存单次构建、持久化与损坏恢复
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

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use common::{CountingModel, write_image};
use detviz::{
  artifact::ArtifactBuilder,
  cache::{ArtifactCache, BundleStore, CacheError, DirectoryStore, MemoryStore},
  filter::{DetectionFilter, FilterConfig},
  input::{ImageIdentity, ImageSource},
  output::NoRender,
  task::{BuildTask, Task},
};

fn task() -> BuildTask {
  BuildTask::new(
    DetectionFilter::new(FilterConfig::default()).unwrap(),
    ArtifactBuilder::default(),
  )
}

fn source(dir: &std::path::Path, name: &str) -> ImageSource {
  ImageSource {
    identity: ImageIdentity::new(name).unwrap(),
    path: write_image(&dir.join(format!("{name}.png")), 64, 48),
    uploaded: false,
  }
}

#[test]
fn concurrent_requests_build_once() {
  const THREADS: usize = 8;
  let images = tempdir().unwrap();
  let src = source(images.path(), "giraffe");
  let cache = ArtifactCache::new(MemoryStore::default());
  let model = CountingModel::default();
  let task = task();
  let barrier = Barrier::new(THREADS);

  let results: Vec<_> = thread::scope(|s| {
    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        s.spawn(|| {
          barrier.wait();
          cache
            .get_or_build(&src.identity, || {
              thread::sleep(Duration::from_millis(50));
              task.run_task(&src, &model, &NoRender)
            })
            .unwrap()
        })
      })
      .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
  });

  assert_eq!(model.calls(), 1);
  assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[test]
fn different_identities_build_independently() {
  let images = tempdir().unwrap();
  let a = source(images.path(), "giraffe");
  let b = source(images.path(), "soccer");
  let cache = ArtifactCache::new(MemoryStore::default());
  let model = CountingModel::default();
  let task = task();

  thread::scope(|s| {
    for src in [&a, &b] {
      let (cache, model, task) = (&cache, &model, &task);
      s.spawn(move || {
        cache
          .get_or_build(&src.identity, || task.run_task(src, model, &NoRender))
          .unwrap();
      });
    }
  });
  assert_eq!(model.calls(), 2);
}

#[test]
fn persisted_bundle_survives_restart() {
  let images = tempdir().unwrap();
  let data = tempdir().unwrap();
  let src = source(images.path(), "snowboard");
  let model = CountingModel::default();
  let task = task();

  let first = {
    let cache = ArtifactCache::new(DirectoryStore::open(data.path()).unwrap());
    cache
      .get_or_build(&src.identity, || task.run_task(&src, &model, &NoRender))
      .unwrap()
  };

  let cache = ArtifactCache::new(DirectoryStore::open(data.path()).unwrap());
  let second = cache
    .get_or_build(&src.identity, || task.run_task(&src, &model, &NoRender))
    .unwrap();

  assert_eq!(model.calls(), 1);
  assert_eq!(*first, *second);
}

#[test]
fn corrupt_bundle_is_rebuilt() {
  let images = tempdir().unwrap();
  let data = tempdir().unwrap();
  let src = source(images.path(), "giraffe");
  let model = CountingModel::default();
  let task = task();

  let store = DirectoryStore::open(data.path()).unwrap();
  ArtifactCache::new(store.clone())
    .get_or_build(&src.identity, || task.run_task(&src, &model, &NoRender))
    .unwrap();
  fs::write(store.identity_dir(&src.identity).join("bundle.json"), b"{ not json").unwrap();

  let cache = ArtifactCache::new(store.clone());
  let bundle = cache
    .get_or_build(&src.identity, || task.run_task(&src, &model, &NoRender))
    .unwrap();
  assert_eq!(model.calls(), 2);
  assert_eq!(bundle.identity, src.identity);
  assert!(store.load(&src.identity).unwrap().is_some());
}

#[test]
fn failed_build_is_not_committed_and_can_retry() {
  let images = tempdir().unwrap();
  let data = tempdir().unwrap();
  let src = source(images.path(), "soccer");
  let model = CountingModel {
    fail_first: 1,
    ..Default::default()
  };
  let task = task();
  let store = DirectoryStore::open(data.path()).unwrap();
  let cache = ArtifactCache::new(store.clone());

  let err = cache
    .get_or_build(&src.identity, || task.run_task(&src, &model, &NoRender))
    .unwrap_err();
  assert!(matches!(err, CacheError::Build(_)));
  assert!(store.load(&src.identity).unwrap().is_none());
  assert!(!store.identity_dir(&src.identity).exists());

  cache
    .get_or_build(&src.identity, || task.run_task(&src, &model, &NoRender))
    .unwrap();
  assert_eq!(model.calls(), 2);
  assert!(store.load(&src.identity).unwrap().is_some());
}

#[test]
fn waiters_share_a_failure() {
  const THREADS: usize = 4;
  let images = tempdir().unwrap();
  let src = source(images.path(), "giraffe");
  let cache = ArtifactCache::new(MemoryStore::default());
  let model = CountingModel {
    fail_first: usize::MAX,
    ..Default::default()
  };
  let task = task();
  let barrier = Barrier::new(THREADS);

  let failures = thread::scope(|s| {
    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        s.spawn(|| {
          barrier.wait();
          cache
            .get_or_build(&src.identity, || {
              thread::sleep(Duration::from_millis(50));
              task.run_task(&src, &model, &NoRender)
            })
            .is_err()
        })
      })
      .collect();
    handles
      .into_iter()
      .map(|h| h.join().unwrap())
      .filter(|failed| *failed)
      .count()
  });

  assert_eq!(failures, THREADS);
  assert!(model.calls() < THREADS);
}
