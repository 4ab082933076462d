//! Synthetic image files for tests.

use image::{GrayImage, Luma};
use std::fs;
use std::path::{Path, PathBuf};

const GRID: u32 = 16;
const BLOCK: u32 = 16;

/// Gray levels for a 16x16 grid of blocks, seeded so distinct seeds give
/// unrelated images.
fn block_levels(seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..GRID * GRID)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // Keep clear of 0 and 255 so brightness shifts never clip.
            20 + (state % 200) as u8
        })
        .collect()
}

fn render(levels: &[u8], offset: u8) -> GrayImage {
    GrayImage::from_fn(GRID * BLOCK, GRID * BLOCK, |x, y| {
        let idx = (y / BLOCK) * GRID + (x / BLOCK);
        Luma([levels[idx as usize] + offset])
    })
}

pub fn write_blocks(dir: &Path, name: &str, seed: u64) -> PathBuf {
    write_blocks_brightened(dir, name, seed, 0)
}

pub fn write_blocks_brightened(dir: &Path, name: &str, seed: u64, offset: u8) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    render(&block_levels(seed), offset).save(&path).unwrap();
    path
}

pub fn write_garbage(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"definitely not a png").unwrap();
    path
}
