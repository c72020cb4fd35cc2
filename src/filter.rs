// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/filter.rs - 置信度过滤、逐层 top-k 与按类别 NMS
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

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::geometry::BoundingBox;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
  #[error("{name} 必须在 [0, 1] 之间, 实际为 {value}")]
  ThresholdOutOfRange { name: &'static str, value: f32 },
}

/// 推理引擎给出的原始候选框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
  pub bbox: BoundingBox,
  pub score: f32,
  pub label: u32,
}

/// 带来源信息的检测结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub bbox: BoundingBox,
  pub score: f32,
  pub label: u32,
  /// 来源金字塔层号
  pub level: u8,
  /// 在来源层原始候选列表中的下标
  pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
  pub confidence_threshold: f32,
  pub top_k_per_level: usize,
  pub iou_threshold: f32,
}

impl Default for FilterConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.05,
      top_k_per_level: 1000,
      iou_threshold: 0.5,
    }
  }
}

impl FilterConfig {
  pub fn validate(&self) -> Result<(), FilterError> {
    for (name, value) in [
      ("confidence_threshold", self.confidence_threshold),
      ("iou_threshold", self.iou_threshold),
    ] {
      if !(0.0..=1.0).contains(&value) {
        return Err(FilterError::ThresholdOutOfRange { name, value });
      }
    }
    Ok(())
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
  pub raw: usize,
  pub below_threshold: usize,
  pub truncated: usize,
  pub suppressed: usize,
  pub kept: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOutput {
  /// 各层 top-k 合并后、NMS 之前的候选
  pub pre_nms: Vec<Detection>,
  /// NMS 之后保留的检测
  pub kept: Vec<Detection>,
  /// 被 NMS 抑制的检测
  pub dropped: Vec<Detection>,
  pub stats: FilterStats,
}

impl FilterOutput {
  pub fn is_empty(&self) -> bool {
    self.kept.is_empty()
  }
}

#[derive(Debug, Clone)]
pub struct DetectionFilter {
  config: FilterConfig,
}

impl DetectionFilter {
  pub fn new(config: FilterConfig) -> Result<Self, FilterError> {
    config.validate()?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &FilterConfig {
    &self.config
  }

  /// 逐层阈值与 top-k，合并后做按类别贪心 NMS
  pub fn filter<'a, I>(&self, levels: I) -> FilterOutput
  where
    I: IntoIterator<Item = (u8, &'a [DetectionCandidate])>,
  {
    let mut stats = FilterStats::default();
    let mut pre_nms = Vec::new();

    for (level, candidates) in levels {
      stats.raw += candidates.len();
      let mut survivors: Vec<Detection> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.score.is_finite() && c.score >= self.config.confidence_threshold)
        .map(|(index, c)| Detection {
          bbox: c.bbox,
          score: c.score,
          label: c.label,
          level,
          index,
        })
        .collect();
      stats.below_threshold += candidates.len() - survivors.len();

      // 稳定排序，同分保持原始下标顺序
      survivors.sort_by(|a, b| b.score.total_cmp(&a.score));
      if survivors.len() > self.config.top_k_per_level {
        stats.truncated += survivors.len() - self.config.top_k_per_level;
        survivors.truncate(self.config.top_k_per_level);
      }

      debug!("P{}: {} 个候选, 阈值与 top-k 后剩余 {}", level, candidates.len(), survivors.len());
      pre_nms.extend(survivors);
    }

    let (kept, dropped) = suppress(&pre_nms, self.config.iou_threshold);
    stats.suppressed = dropped.len();
    stats.kept = kept.len();

    FilterOutput {
      kept: kept.into_iter().map(|i| pre_nms[i]).collect(),
      dropped: dropped.into_iter().map(|i| pre_nms[i]).collect(),
      pre_nms,
      stats,
    }
  }
}

/// 按类别贪心 NMS，返回保留的检测，顺序为分数降序、同分按输入顺序
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
  let (kept, _) = suppress(detections, iou_threshold);
  kept.into_iter().map(|i| detections[i]).collect()
}

fn rank(detections: &[Detection], a: usize, b: usize) -> Ordering {
  detections[b]
    .score
    .total_cmp(&detections[a].score)
    .then(a.cmp(&b))
}

/// 返回 (保留下标, 抑制下标)，均按 `rank` 排序
fn suppress(detections: &[Detection], iou_threshold: f32) -> (Vec<usize>, Vec<usize>) {
  let mut order: Vec<usize> = (0..detections.len()).collect();
  order.sort_by(|&a, &b| rank(detections, a, b));

  let mut by_class: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
  for &i in &order {
    by_class.entry(detections[i].label).or_default().push(i);
  }

  let mut keep = vec![false; detections.len()];
  for (_, mut remaining) in by_class {
    while !remaining.is_empty() {
      let best = remaining.remove(0);
      keep[best] = true;
      let best_box = detections[best].bbox;
      remaining.retain(|&i| best_box.iou(&detections[i].bbox) <= iou_threshold);
    }
  }

  order.into_iter().partition(|&i| keep[i])
}
