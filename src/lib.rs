//! PCM Bridge Library
//!
//! Lock-free sample transport between an engine and the platform audio callback.

#![allow(dead_code, unused_mut)]

pub mod audio;
pub mod bridge;
