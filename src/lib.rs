// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # chrootfs
//!
//! > A chroot file-system personality for a library OS.
//!
//! `chrootfs` sits between guest processes and a platform abstraction layer
//! (PAL): guest-visible POSIX file operations (open, read, write, mmap,
//! truncate, readdir, unlink, rename, chmod, stat, seek, poll, flush) are
//! mapped onto host-backed stream objects that the PAL exposes as typed URIs
//! (`file:`, `dir:`, `dev:`).
//!
//! To use this crate, provide a type implementing the [`pal::Pal`] trait;
//! the [`fs::chroot::ChrootFs`] personality then serves the operation tables
//! defined in [`fs`] on top of the directory cache in [`dcache`].

#![no_std]

extern crate alloc;

pub mod dcache;
pub mod errno;
pub mod fs;
pub mod pal;

// Explicitly-private small helpers, not exposed to users of the personality.
mod utils;
