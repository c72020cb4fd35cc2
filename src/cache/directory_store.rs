// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/cache/directory_store.rs - 目录持久化存储
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

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BundleStore, StoreError};
use crate::{
  artifact::{ArtifactBundle, PendingBundle},
  input::ImageIdentity,
};

const FORMAT_VERSION: u32 = 1;
const BUNDLE_FILE: &str = "bundle.json";
const MANIFEST_FILE: &str = "manifest.json";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
  format_version: u32,
  identity: ImageIdentity,
  created_at: DateTime<Utc>,
}

/// 每个标识一个子目录：`<root>/<identity>/{manifest.json, bundle.json, ...}`。
///
/// 提交时先写入临时目录，再以重命名替换旧目录；`manifest.json` 最后写入，
/// 缺少它的目录视为不完整。
#[derive(Debug, Clone)]
pub struct DirectoryStore {
  root: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
  move |source| StoreError::Io {
    path: path.to_path_buf(),
    source,
  }
}

impl DirectoryStore {
  /// 创建根目录，并清理上次中断遗留的临时目录
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let root = root.into();
    fs::create_dir_all(&root).map_err(io_err(&root))?;
    for entry in fs::read_dir(&root).map_err(io_err(&root))? {
      let entry = entry.map_err(io_err(&root))?;
      let name = entry.file_name();
      let name = name.to_string_lossy();
      if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
        debug!("清理遗留目录: {}", entry.path().display());
        if let Err(e) = fs::remove_dir_all(entry.path()) {
          warn!("无法清理 {}: {}", entry.path().display(), e);
        }
      }
    }
    info!("缓存目录: {}", root.display());
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn identity_dir(&self, identity: &ImageIdentity) -> PathBuf {
    self.root.join(identity.as_str())
  }

  /// 渲染文件的绝对路径
  pub fn asset_path(&self, identity: &ImageIdentity, relative: &Path) -> PathBuf {
    self.identity_dir(identity).join(relative)
  }

  fn scratch_dir(&self, prefix: &str, identity: &ImageIdentity) -> PathBuf {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    self
      .root
      .join(format!("{prefix}{identity}-{}-{seq}", std::process::id()))
  }

  fn write_staging(&self, staging: &Path, pending: &PendingBundle) -> Result<(), StoreError> {
    fs::create_dir_all(staging).map_err(io_err(staging))?;

    for file in &pending.side_files {
      if !is_relative_inside(&file.relative_path) {
        return Err(StoreError::InvalidPath(file.relative_path.clone()));
      }
      let path = staging.join(&file.relative_path);
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
      }
      fs::write(&path, &file.bytes).map_err(io_err(&path))?;
    }

    let path = staging.join(BUNDLE_FILE);
    fs::write(&path, serde_json::to_vec(&pending.bundle)?).map_err(io_err(&path))?;

    let manifest = Manifest {
      format_version: FORMAT_VERSION,
      identity: pending.bundle.identity.clone(),
      created_at: Utc::now(),
    };
    let path = staging.join(MANIFEST_FILE);
    fs::write(&path, serde_json::to_vec_pretty(&manifest)?).map_err(io_err(&path))?;
    Ok(())
  }

  fn corrupt(identity: &ImageIdentity, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
      identity: identity.clone(),
      reason: reason.into(),
    }
  }

  // 将目录移出根目录下的可见位置后再删除
  fn discard(&self, dir: &Path, identity: &ImageIdentity) -> Result<(), StoreError> {
    let trash = self.scratch_dir(TRASH_PREFIX, identity);
    match fs::rename(dir, &trash) {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
      Err(e) => return Err(io_err(dir)(e)),
    }
    if let Err(e) = fs::remove_dir_all(&trash) {
      warn!("无法删除 {}: {}", trash.display(), e);
    }
    Ok(())
  }
}

fn is_relative_inside(path: &Path) -> bool {
  path.components().next().is_some()
    && path.components().all(|c| matches!(c, Component::Normal(_)))
}

impl BundleStore for DirectoryStore {
  fn load(&self, identity: &ImageIdentity) -> Result<Option<ArtifactBundle>, StoreError> {
    let dir = self.identity_dir(identity);
    if !dir.is_dir() {
      return Ok(None);
    }

    let raw = fs::read(dir.join(MANIFEST_FILE))
      .map_err(|e| Self::corrupt(identity, format!("无法读取 {MANIFEST_FILE}: {e}")))?;
    let manifest: Manifest = serde_json::from_slice(&raw)
      .map_err(|e| Self::corrupt(identity, format!("{MANIFEST_FILE} 解析失败: {e}")))?;
    if manifest.format_version != FORMAT_VERSION {
      return Err(Self::corrupt(
        identity,
        format!("格式版本 {} 不受支持", manifest.format_version),
      ));
    }
    if manifest.identity != *identity {
      return Err(Self::corrupt(identity, format!("清单属于 {}", manifest.identity)));
    }

    let raw = fs::read(dir.join(BUNDLE_FILE))
      .map_err(|e| Self::corrupt(identity, format!("无法读取 {BUNDLE_FILE}: {e}")))?;
    let bundle: ArtifactBundle = serde_json::from_slice(&raw)
      .map_err(|e| Self::corrupt(identity, format!("{BUNDLE_FILE} 解析失败: {e}")))?;
    if bundle.identity != *identity {
      return Err(Self::corrupt(identity, format!("产物包属于 {}", bundle.identity)));
    }

    if let Some(missing) = bundle
      .assets
      .paths()
      .find(|p| !is_relative_inside(p) || !dir.join(p).is_file())
    {
      return Err(Self::corrupt(
        identity,
        format!("缺少附属文件 {}", missing.display()),
      ));
    }

    debug!(
      "{}: 读取缓存，创建于 {}",
      identity,
      manifest.created_at.to_rfc3339()
    );
    Ok(Some(bundle))
  }

  fn commit(&self, identity: &ImageIdentity, pending: &PendingBundle) -> Result<(), StoreError> {
    let staging = self.scratch_dir(STAGING_PREFIX, identity);
    if let Err(e) = self.write_staging(&staging, pending) {
      let _ = fs::remove_dir_all(&staging);
      return Err(e);
    }

    let target = self.identity_dir(identity);
    self.discard(&target, identity)?;
    fs::rename(&staging, &target).map_err(io_err(&target))?;
    debug!("{}: 写入 {}", identity, target.display());
    Ok(())
  }

  fn clear(&self, identity: &ImageIdentity) -> Result<(), StoreError> {
    self.discard(&self.identity_dir(identity), identity)
  }
}
