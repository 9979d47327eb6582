//! Integration test crate for the readback pipeline.
//!
//! This crate exists solely to hold cross-crate integration tests. Every
//! scenario runs on the software context, so no GPU is required.

#[cfg(test)]
mod common;

#[cfg(test)]
mod scaling;

#[cfg(test)]
mod sharing;

#[cfg(test)]
mod yuv;

#[cfg(test)]
mod readback;
