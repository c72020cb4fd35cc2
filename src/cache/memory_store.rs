// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/cache/memory_store.rs - 进程内存储
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

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{BundleStore, StoreError};
use crate::{
  artifact::{ArtifactBundle, PendingBundle},
  input::ImageIdentity,
};

/// 不落盘的存储，进程退出后内容丢失
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<ImageIdentity, PendingBundle>>,
}

impl MemoryStore {
  /// 已提交的附属文件
  pub fn side_file(&self, identity: &ImageIdentity, relative: &std::path::Path) -> Option<Vec<u8>> {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries
      .get(identity)?
      .side_files
      .iter()
      .find(|f| f.relative_path == relative)
      .map(|f| f.bytes.clone())
  }
}

impl BundleStore for MemoryStore {
  fn load(&self, identity: &ImageIdentity) -> Result<Option<ArtifactBundle>, StoreError> {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(entries.get(identity).map(|p| p.bundle.clone()))
  }

  fn commit(&self, identity: &ImageIdentity, pending: &PendingBundle) -> Result<(), StoreError> {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.insert(identity.clone(), pending.clone());
    Ok(())
  }

  fn clear(&self, identity: &ImageIdentity) -> Result<(), StoreError> {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    entries.remove(identity);
    Ok(())
  }
}
