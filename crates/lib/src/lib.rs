//! # Bootable disk image assembly
//!
//! This crate turns a populated root filesystem into a bootable raw disk
//! image: the image file is attached to a loop device and partitioned, the
//! partitions are mounted and filled, and a bootloader is installed,
//! optionally protecting the root filesystem with dm-verity.
//!
//! Every external tool is invoked through a
//! [`CommandRunner`](imagecraft_utils::CommandRunner), and all
//! configuration arrives through an explicit [`BuildContext`].

pub mod bootloader;
pub mod cli;
pub mod config;
pub mod disk;
mod error;
pub mod image;
pub mod kernel;
pub mod kernel_cmdline;
mod mount;
pub mod mountpoint;
pub mod partition_types;
pub mod template;
pub mod uki;
pub mod verity;

pub use bootloader::install_bootloader;
pub use config::BuildContext;
pub use error::{kind as error_kind, Error};
pub use image::{build_image, create_raw_image_loopdev, loop_setup_delete, RootPopulator};
pub use mountpoint::{device_for_mount_point, DeviceMap};
