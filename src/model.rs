// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/model.rs - 推理引擎接口
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::DetectionCandidate;
use crate::geometry::ImageSize;

/// 推理引擎。网络本身是黑盒，只要求报告各层的层号与步长
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 单层特征图，按 CHW 顺序存储
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMap {
  pub channels: u32,
  pub height: u32,
  pub width: u32,
  pub data: Vec<f32>,
}

impl FeatureMap {
  pub fn plane_len(&self) -> usize {
    self.height as usize * self.width as usize
  }

  pub fn channel(&self, c: u32) -> Option<&[f32]> {
    if c >= self.channels {
      return None;
    }
    let len = self.plane_len();
    let start = c as usize * len;
    self.data.get(start..start + len)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelOutput {
  /// 层号，例如 P3 为 3
  pub level: u8,
  pub stride: u32,
  pub feature_map: FeatureMap,
  #[serde(default)]
  pub candidates: Vec<DetectionCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
  pub image_size: ImageSize,
  pub levels: Vec<LevelOutput>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("推理输出没有任何金字塔层")]
  NoLevels,
  #[error("金字塔层 P{0} 重复")]
  DuplicateLevel(u8),
  #[error("金字塔层 P{0} 的步长为 0")]
  ZeroStride(u8),
  #[error("P{level} 特征图数据长度 {actual} 与形状 {channels}x{height}x{width} 不符")]
  FeatureShape {
    level: u8,
    channels: u32,
    height: u32,
    width: u32,
    actual: usize,
  },
  #[error("P{level} 第 {index} 个候选框分数无效: {score}")]
  InvalidScore { level: u8, index: usize, score: f32 },
  #[error("图像尺寸不符: 期望 {expected}, 实际 {actual}")]
  SizeMismatch { expected: ImageSize, actual: ImageSize },
}

impl InferenceOutput {
  /// 检查引擎输出的结构是否完整；边界框本身在反序列化时已校验
  pub fn validate(&self) -> Result<(), InferenceError> {
    if self.levels.is_empty() {
      return Err(InferenceError::NoLevels);
    }
    let mut seen = Vec::with_capacity(self.levels.len());
    for level in &self.levels {
      if seen.contains(&level.level) {
        return Err(InferenceError::DuplicateLevel(level.level));
      }
      seen.push(level.level);

      if level.stride == 0 {
        return Err(InferenceError::ZeroStride(level.level));
      }

      let fm = &level.feature_map;
      let expected = fm.channels as usize * fm.plane_len();
      if fm.data.len() != expected {
        return Err(InferenceError::FeatureShape {
          level: level.level,
          channels: fm.channels,
          height: fm.height,
          width: fm.width,
          actual: fm.data.len(),
        });
      }

      for (index, c) in level.candidates.iter().enumerate() {
        if !(0.0..=1.0).contains(&c.score) {
          return Err(InferenceError::InvalidScore {
            level: level.level,
            index,
            score: c.score,
          });
        }
      }
    }
    Ok(())
  }

  pub fn candidate_count(&self) -> usize {
    self.levels.iter().map(|l| l.candidates.len()).sum()
  }
}

/// COCO 类别名称，下标即模型输出的类别编号
pub const COCO_LABELS: [&str; 91] = [
  "__background__",
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "N/A",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "N/A",
  "backpack",
  "umbrella",
  "N/A",
  "N/A",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "N/A",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "N/A",
  "dining table",
  "N/A",
  "N/A",
  "toilet",
  "N/A",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "N/A",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

pub fn label_name(label: u32) -> &'static str {
  COCO_LABELS.get(label as usize).copied().unwrap_or("unknown")
}

/// 可被识别的类别（去掉背景与占位项）
pub fn recognizable_labels() -> impl Iterator<Item = &'static str> {
  COCO_LABELS
    .iter()
    .copied()
    .filter(|l| *l != "N/A" && *l != "__background__")
}

mod replay;
pub use self::replay::{ReplayError, ReplayModel, ReplayModelBuilder};
