// 该文件是 Detviz （检测可视化） 项目的一部分。
// src/bin/anchor_stats.rs - 不经推理统计锚框数量
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use detviz::{
  anchor::AnchorGridGenerator,
  config::PipelineConfig,
  geometry::ImageSize,
};

/// 按 RetinaNet P3-P7 金字塔统计锚框
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 图像宽度
  #[arg(long, value_name = "PIXELS")]
  pub width: u32,
  /// 图像高度
  #[arg(long, value_name = "PIXELS")]
  pub height: u32,
  /// JSON 配置文件（只使用其中的锚框配置）
  #[arg(long, value_name = "FILE")]
  pub config: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = match &args.config {
    Some(path) => PipelineConfig::load(path).context("加载配置文件失败")?,
    None => PipelineConfig::default(),
  };

  let size = ImageSize::new(args.width, args.height).context("图像尺寸无效")?;
  let levels = config.anchors.retinanet_levels()?;
  info!("图像尺寸: {}, {} 层", size, levels.len());

  let generator = AnchorGridGenerator;
  let stats = generator.pyramid_stats(&levels, size)?;
  for s in &stats {
    println!(
      "P{}\t步长 {:>3}\t网格 {:>4}x{:<4}\t模板 {}\t锚框 {}",
      s.level, s.stride, s.grid.width, s.grid.height, s.templates, s.total
    );
  }
  println!("总计 {}", stats.iter().map(|s| s.total).sum::<usize>());

  Ok(())
}
