// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::Parser;
use url::Url;

use detviz::session::Step;

/// Detviz 参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理引擎，例如 replay:///path/to/recordings
  #[arg(long, value_name = "ENGINE")]
  pub engine: Url,

  /// 图像选择
  /// - 预置图像: preset://giraffe, preset://soccer, preset://snowboard
  /// - 上传图像: image:///path/to/file.jpg
  #[arg(long, value_name = "IMAGE")]
  pub image: Url,

  /// 依次进入的步骤（welcome, features, anchors, nms, reference）
  #[arg(
    long,
    value_delimiter = ',',
    default_value = "welcome,features,anchors,nms,reference",
    value_name = "STEPS"
  )]
  pub steps: Vec<Step>,

  /// JSON 配置文件
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,

  /// 每层保留的最高分候选数
  #[arg(long, value_name = "COUNT")]
  pub top_k: Option<usize>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,

  /// 缓存目录
  #[arg(long, value_name = "DIR")]
  pub cache_dir: Option<PathBuf>,

  /// 预置图像目录
  #[arg(long, value_name = "DIR")]
  pub preset_dir: Option<PathBuf>,

  /// 只在内存中缓存
  #[arg(long)]
  pub no_persist: bool,
}
