// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/artifact.rs - 产物包的组装
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

use std::collections::BTreeMap;
use std::path::PathBuf;

use rand::{SeedableRng, rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  anchor::{AnchorConfig, AnchorError, AnchorGridGenerator, AnchorStats, PyramidLevel},
  filter::FilterOutput,
  geometry::{BoundingBox, ImageSize},
  input::ImageIdentity,
  model::InferenceOutput,
};

/// 特征图与锚框的抽样参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
  pub feature_samples_per_level: usize,
  pub feature_seed: u64,
  /// 每层抽取的锚框比例
  pub anchor_sample_fraction: f64,
  pub min_anchor_samples: usize,
  pub max_anchor_samples: usize,
  pub anchor_seed: u64,
}

impl Default for SamplingConfig {
  fn default() -> Self {
    Self {
      feature_samples_per_level: 7,
      feature_seed: 42,
      anchor_sample_fraction: 0.003,
      min_anchor_samples: 1,
      max_anchor_samples: 2000,
      anchor_seed: 24,
    }
  }
}

impl SamplingConfig {
  fn anchor_sample_size(&self, total: usize) -> usize {
    let wanted = (total as f64 * self.anchor_sample_fraction).round() as usize;
    wanted
      .clamp(self.min_anchor_samples, self.max_anchor_samples.max(self.min_anchor_samples))
      .min(total)
  }
}

/// 某一层抽取的特征通道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSample {
  pub level: u8,
  pub stride: u32,
  pub height: u32,
  pub width: u32,
  pub total_channels: u32,
  /// 抽取顺序
  pub channels: Vec<u32>,
  /// 与 `channels` 一一对应的 HW 平面
  pub maps: Vec<Vec<f32>>,
}

/// 某一层的锚框统计与用于叠加显示的抽样
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelAnchors {
  pub stats: AnchorStats,
  /// 升序的锚框下标
  pub sample_indices: Vec<usize>,
  pub sample: Vec<BoundingBox>,
}

/// 相对于标识目录的渲染文件路径
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedAssets {
  pub feature_maps: Option<PathBuf>,
  /// 层名 (如 "P3") 到锚框叠加图
  pub anchors: BTreeMap<String, PathBuf>,
  pub without_nms: Option<PathBuf>,
  pub with_nms: Option<PathBuf>,
}

impl RenderedAssets {
  pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
    self
      .feature_maps
      .iter()
      .chain(self.anchors.values())
      .chain(self.without_nms.iter())
      .chain(self.with_nms.iter())
  }
}

/// 一个图像标识的全部产物。提交到缓存后只以只读方式共享
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBundle {
  pub identity: ImageIdentity,
  pub image_size: ImageSize,
  pub feature_samples: Vec<FeatureSample>,
  pub anchors: Vec<LevelAnchors>,
  pub total_anchors: usize,
  pub detections: FilterOutput,
  #[serde(default)]
  pub assets: RenderedAssets,
}

impl ArtifactBundle {
  pub fn has_detections(&self) -> bool {
    !self.detections.kept.is_empty()
  }

  pub fn level_anchors(&self, level: u8) -> Option<&LevelAnchors> {
    self.anchors.iter().find(|a| a.stats.level == level)
  }
}

/// 与产物包一同提交的附属文件
#[derive(Debug, Clone, PartialEq)]
pub struct SideFile {
  pub relative_path: PathBuf,
  pub bytes: Vec<u8>,
}

/// 尚未提交的产物包
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBundle {
  pub bundle: ArtifactBundle,
  pub side_files: Vec<SideFile>,
}

impl From<ArtifactBundle> for PendingBundle {
  fn from(bundle: ArtifactBundle) -> Self {
    Self {
      bundle,
      side_files: Vec::new(),
    }
  }
}

/// 组装产物包，不做任何 I/O
#[derive(Debug, Clone, Default)]
pub struct ArtifactBuilder {
  generator: AnchorGridGenerator,
  anchor_config: AnchorConfig,
  sampling: SamplingConfig,
}

impl ArtifactBuilder {
  pub fn new(anchor_config: AnchorConfig, sampling: SamplingConfig) -> Self {
    Self {
      generator: AnchorGridGenerator,
      anchor_config,
      sampling,
    }
  }

  /// 由引擎报告的层号与步长描述金字塔
  pub fn levels(&self, output: &InferenceOutput) -> Result<Vec<PyramidLevel>, AnchorError> {
    output
      .levels
      .iter()
      .map(|l| {
        self
          .anchor_config
          .level(l.level, l.stride, l.feature_map.channels)
      })
      .collect()
  }

  pub fn build(
    &self,
    identity: ImageIdentity,
    output: &InferenceOutput,
    detections: FilterOutput,
  ) -> Result<ArtifactBundle, AnchorError> {
    let levels = self.levels(output)?;
    let feature_samples = self.sample_features(output);
    let anchors = self.sample_anchors(&levels, output.image_size)?;
    let total_anchors = anchors.iter().map(|a| a.stats.total).sum();

    debug!(
      "{}: {} 层, 共 {} 个锚框, NMS 前 {} / 后 {}",
      identity,
      levels.len(),
      total_anchors,
      detections.pre_nms.len(),
      detections.kept.len()
    );

    Ok(ArtifactBundle {
      identity,
      image_size: output.image_size,
      feature_samples,
      anchors,
      total_anchors,
      detections,
      assets: RenderedAssets::default(),
    })
  }

  fn sample_features(&self, output: &InferenceOutput) -> Vec<FeatureSample> {
    let mut rng = StdRng::seed_from_u64(self.sampling.feature_seed);
    output
      .levels
      .iter()
      .map(|l| {
        let fm = &l.feature_map;
        let amount = self.sampling.feature_samples_per_level.min(fm.channels as usize);
        let channels: Vec<u32> = index::sample(&mut rng, fm.channels as usize, amount)
          .into_iter()
          .map(|c| c as u32)
          .collect();
        let maps = channels
          .iter()
          .filter_map(|&c| fm.channel(c).map(<[f32]>::to_vec))
          .collect();
        FeatureSample {
          level: l.level,
          stride: l.stride,
          height: fm.height,
          width: fm.width,
          total_channels: fm.channels,
          channels,
          maps,
        }
      })
      .collect()
  }

  fn sample_anchors(
    &self,
    levels: &[PyramidLevel],
    image_size: ImageSize,
  ) -> Result<Vec<LevelAnchors>, AnchorError> {
    let mut rng = StdRng::seed_from_u64(self.sampling.anchor_seed);
    levels
      .iter()
      .map(|level| {
        let stats = self.generator.stats(level, image_size)?;
        let amount = self.sampling.anchor_sample_size(stats.total);
        let mut sample_indices = index::sample(&mut rng, stats.total, amount).into_vec();
        sample_indices.sort_unstable();
        let sample = sample_indices
          .iter()
          .filter_map(|&i| self.generator.anchor_at(level, stats.grid, i))
          .collect();
        Ok(LevelAnchors {
          stats,
          sample_indices,
          sample,
        })
      })
      .collect()
  }
}
