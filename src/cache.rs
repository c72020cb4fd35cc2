// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/cache.rs - 按图像标识缓存产物包
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

//! 产物缓存。
//!
//! 每个 [`ImageIdentity`] 对应一个槽位，同一标识的并发请求只会触发一次构建，
//! 其余请求等待构建结果。构建结果先整体提交到 [`BundleStore`]，成功后才对读者可见。
//! 存储中损坏或不完整的数据按未命中处理。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  artifact::{ArtifactBundle, PendingBundle},
  input::ImageIdentity,
  task::BuildError,
};

mod directory_store;
mod memory_store;
pub use self::directory_store::DirectoryStore;
pub use self::memory_store::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("序列化失败: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("{identity} 的缓存数据损坏: {reason}")]
  Corrupt {
    identity: ImageIdentity,
    reason: String,
  },
  #[error("非法的附属文件路径: {0}")]
  InvalidPath(PathBuf),
}

#[derive(Error, Debug)]
pub enum CacheError {
  #[error("构建失败: {0}")]
  Build(#[from] BuildError),
  #[error("{identity} 的构建失败: {reason}")]
  BuildFailed {
    identity: ImageIdentity,
    reason: Arc<str>,
  },
  #[error("{identity} 在构建期间被替换")]
  Superseded { identity: ImageIdentity },
  #[error("存储错误: {0}")]
  Store(#[from] StoreError),
}

/// 产物包的持久化后端
pub trait BundleStore: Send + Sync {
  /// `Ok(None)` 表示不存在；损坏的数据返回 [`StoreError::Corrupt`]
  fn load(&self, identity: &ImageIdentity) -> Result<Option<ArtifactBundle>, StoreError>;
  /// 整体提交，读者要么看到旧内容要么看到新内容
  fn commit(&self, identity: &ImageIdentity, pending: &PendingBundle) -> Result<(), StoreError>;
  fn clear(&self, identity: &ImageIdentity) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
enum SlotState {
  Empty,
  Building { flight: u64 },
  Ready(Arc<ArtifactBundle>),
  Failed { flight: u64, reason: Arc<str> },
}

#[derive(Debug)]
struct SlotInner {
  state: SlotState,
  /// 每次失效加一，构建完成时据此判断结果是否过期
  epoch: u64,
  next_flight: u64,
}

#[derive(Debug)]
struct Slot {
  inner: Mutex<SlotInner>,
  cond: Condvar,
}

impl Slot {
  fn new() -> Self {
    Self {
      inner: Mutex::new(SlotInner {
        state: SlotState::Empty,
        epoch: 0,
        next_flight: 0,
      }),
      cond: Condvar::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, SlotInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// 构建方在 panic 时把槽位标记为失败，避免等待者永远阻塞
struct FlightGuard<'a> {
  slot: &'a Slot,
  flight: u64,
  armed: bool,
}

impl FlightGuard<'_> {
  fn disarm(mut self) {
    self.armed = false;
  }
}

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut inner = self.slot.lock();
    if matches!(inner.state, SlotState::Building { flight } if flight == self.flight) {
      inner.state = SlotState::Failed {
        flight: self.flight,
        reason: Arc::from("构建中断"),
      };
      self.slot.cond.notify_all();
    }
  }
}

pub struct ArtifactCache<S: BundleStore> {
  store: S,
  slots: Mutex<HashMap<ImageIdentity, Arc<Slot>>>,
}

impl<S: BundleStore> ArtifactCache<S> {
  pub fn new(store: S) -> Self {
    Self {
      store,
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  fn slot(&self, identity: &ImageIdentity) -> Arc<Slot> {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots
      .entry(identity.clone())
      .or_insert_with(|| Arc::new(Slot::new()))
      .clone()
  }

  /// 已在内存中就绪的产物包，不触发加载或构建
  pub fn peek(&self, identity: &ImageIdentity) -> Option<Arc<ArtifactBundle>> {
    match &self.slot(identity).lock().state {
      SlotState::Ready(bundle) => Some(bundle.clone()),
      _ => None,
    }
  }

  /// 取得标识对应的产物包；不存在时先尝试从存储加载，仍未命中则调用 `build`。
  ///
  /// 同一标识同时只有一个调用方执行 `build`，其余调用方等待并共享结果。
  /// 构建失败不会提交，之后的调用会重新构建。
  pub fn get_or_build<F>(
    &self,
    identity: &ImageIdentity,
    build: F,
  ) -> Result<Arc<ArtifactBundle>, CacheError>
  where
    F: FnOnce() -> Result<PendingBundle, BuildError>,
  {
    let slot = self.slot(identity);

    let (flight, epoch) = {
      let mut inner = slot.lock();
      let mut waited_on = None;
      loop {
        match inner.state.clone() {
          SlotState::Ready(bundle) => {
            debug!("{}: 命中内存缓存", identity);
            return Ok(bundle);
          }
          SlotState::Building { flight } => {
            debug!("{}: 等待正在进行的构建", identity);
            waited_on = Some(flight);
            inner = slot.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
          }
          SlotState::Failed { flight, reason } if waited_on == Some(flight) => {
            return Err(CacheError::BuildFailed {
              identity: identity.clone(),
              reason,
            });
          }
          SlotState::Empty | SlotState::Failed { .. } => break,
        }
      }
      let flight = inner.next_flight;
      inner.next_flight += 1;
      inner.state = SlotState::Building { flight };
      (flight, inner.epoch)
    };

    let guard = FlightGuard {
      slot: &slot,
      flight,
      armed: true,
    };
    let result = self.load_or_build(identity, build);

    let mut inner = slot.lock();
    guard.disarm();
    if inner.epoch != epoch {
      info!("{}: 构建期间已失效，丢弃结果", identity);
      slot.cond.notify_all();
      return Err(CacheError::Superseded {
        identity: identity.clone(),
      });
    }

    let outcome = result.and_then(|(bundle, pending)| {
      if let Some(pending) = pending {
        self.store.commit(identity, &pending)?;
        info!("{}: 已提交", identity);
      }
      Ok(bundle)
    });

    match outcome {
      Ok(bundle) => {
        inner.state = SlotState::Ready(bundle.clone());
        slot.cond.notify_all();
        Ok(bundle)
      }
      Err(err) => {
        warn!("{}: 构建失败: {}", identity, err);
        inner.state = SlotState::Failed {
          flight,
          reason: Arc::from(err.to_string()),
        };
        slot.cond.notify_all();
        Err(err)
      }
    }
  }

  // 不持有槽位锁。返回的 PendingBundle 为 None 表示来自存储，无需再次提交
  fn load_or_build<F>(
    &self,
    identity: &ImageIdentity,
    build: F,
  ) -> Result<(Arc<ArtifactBundle>, Option<PendingBundle>), CacheError>
  where
    F: FnOnce() -> Result<PendingBundle, BuildError>,
  {
    match self.store.load(identity) {
      Ok(Some(bundle)) => {
        info!("{}: 从存储加载", identity);
        return Ok((Arc::new(bundle), None));
      }
      Ok(None) => debug!("{}: 存储中不存在", identity),
      Err(err) => warn!("{}: 存储数据不可用，重新构建: {}", identity, err),
    }

    let pending = build()?;
    if pending.bundle.identity != *identity {
      return Err(
        StoreError::Corrupt {
          identity: identity.clone(),
          reason: format!("构建结果属于 {}", pending.bundle.identity),
        }
        .into(),
      );
    }
    Ok((Arc::new(pending.bundle.clone()), Some(pending)))
  }

  /// 清除标识的内存与持久化内容。进行中的构建结果会被丢弃
  pub fn invalidate(&self, identity: &ImageIdentity) -> Result<(), CacheError> {
    let slot = self.slot(identity);
    let mut inner = slot.lock();
    self.store.clear(identity)?;
    inner.epoch += 1;
    inner.state = SlotState::Empty;
    slot.cond.notify_all();
    info!("{}: 已失效", identity);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::RenderedAssets;
  use crate::filter::FilterOutput;
  use crate::geometry::ImageSize;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn bundle(identity: &ImageIdentity, width: u32) -> PendingBundle {
    ArtifactBundle {
      identity: identity.clone(),
      image_size: ImageSize::new(width, 10).unwrap(),
      feature_samples: vec![],
      anchors: vec![],
      total_anchors: 0,
      detections: FilterOutput::default(),
      assets: RenderedAssets::default(),
    }
    .into()
  }

  #[test]
  fn builds_once_then_hits() {
    let cache = ArtifactCache::new(MemoryStore::default());
    let id = ImageIdentity::new("giraffe").unwrap();
    let calls = AtomicUsize::new(0);
    for _ in 0..3 {
      let got = cache
        .get_or_build(&id, || {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(bundle(&id, 20))
        })
        .unwrap();
      assert_eq!(got.image_size.width, 20);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.peek(&id).is_some());
  }

  #[test]
  fn failure_is_not_committed_and_retry_builds() {
    let cache = ArtifactCache::new(MemoryStore::default());
    let id = ImageIdentity::new("soccer").unwrap();
    let err = cache
      .get_or_build(&id, || Err(BuildError::Inference("boom".into())))
      .unwrap_err();
    assert!(matches!(err, CacheError::Build(_)));
    assert!(cache.peek(&id).is_none());
    assert!(cache.store().load(&id).unwrap().is_none());

    let got = cache.get_or_build(&id, || Ok(bundle(&id, 30))).unwrap();
    assert_eq!(got.image_size.width, 30);
  }

  #[test]
  fn invalidate_forces_rebuild() {
    let cache = ArtifactCache::new(MemoryStore::default());
    let id = ImageIdentity::custom();
    cache.get_or_build(&id, || Ok(bundle(&id, 11))).unwrap();
    cache.invalidate(&id).unwrap();
    assert!(cache.peek(&id).is_none());
    let got = cache.get_or_build(&id, || Ok(bundle(&id, 12))).unwrap();
    assert_eq!(got.image_size.width, 12);
  }

  #[test]
  fn invalidate_during_build_discards_result() {
    let cache = ArtifactCache::new(MemoryStore::default());
    let id = ImageIdentity::custom();
    let err = cache
      .get_or_build(&id, || {
        cache.invalidate(&id).unwrap();
        Ok(bundle(&id, 13))
      })
      .unwrap_err();
    assert!(matches!(err, CacheError::Superseded { .. }));
    assert!(cache.store().load(&id).unwrap().is_none());
  }

  #[test]
  fn mismatched_identity_is_rejected() {
    let cache = ArtifactCache::new(MemoryStore::default());
    let id = ImageIdentity::new("giraffe").unwrap();
    let other = ImageIdentity::new("soccer").unwrap();
    assert!(cache.get_or_build(&id, || Ok(bundle(&other, 1))).is_err());
  }

  #[test]
  fn panicking_builder_releases_slot() {
    let cache = ArtifactCache::new(MemoryStore::default());
    let id = ImageIdentity::new("snowboard").unwrap();
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _ = cache.get_or_build(&id, || panic!("model crashed"));
    }));
    assert!(caught.is_err());
    let got = cache.get_or_build(&id, || Ok(bundle(&id, 5))).unwrap();
    assert_eq!(got.image_size.width, 5);
  }
}
