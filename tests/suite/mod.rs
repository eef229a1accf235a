mod blocks;
mod cache;
mod resolution;
