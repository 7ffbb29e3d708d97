//! # Command line interface
//!
//! Parses arguments and drives the library; this is the only place output
//! is presented to the user.

use std::ffi::OsString;

use anyhow::{ensure, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use imagecraft_utils::HostRunner;

use crate::config::BuildContext;
use crate::image::{build_image, CopyTree};

/// Options for building an image.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct BuildOpts {
    /// The build configuration (TOML, or JSON with a `.json` extension)
    #[clap(long)]
    pub(crate) config: Utf8PathBuf,

    /// Directory tree copied into the image as its root filesystem
    #[clap(long)]
    pub(crate) rootfs: Utf8PathBuf,

    /// Where to write the raw disk image; an existing file is replaced
    #[clap(long, short = 'o')]
    pub(crate) output: Utf8PathBuf,

    /// Directory the image partitions are mounted on while building
    #[clap(long, default_value = "/run/imagecraft/root")]
    pub(crate) install_root: Utf8PathBuf,
}

/// Assemble bootable disk images.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "imagecraft", version)]
pub(crate) struct Opt {
    #[clap(subcommand)]
    pub(crate) cmd: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum Command {
    /// Build a raw disk image: partition it, copy in the root filesystem
    /// and install the bootloader.
    ///
    /// With immutability enabled, the dm-verity root hash is printed.
    Build(BuildOpts),
    /// Check a build configuration without touching any device.
    Validate {
        /// The build configuration
        config: Utf8PathBuf,
    },
}

fn run_from_opt(opt: Opt) -> Result<()> {
    match opt.cmd {
        Command::Build(opts) => {
            ensure!(
                rustix::process::getuid().is_root(),
                "Must run as the root user"
            );
            let ctx = BuildContext::load(&opts.config)?;
            let verity = build_image(
                &ctx,
                &HostRunner,
                &opts.output,
                &opts.install_root,
                &CopyTree(opts.rootfs),
            )?;
            if let Some(v) = verity {
                println!("{}", v.root_hash);
            }
            Ok(())
        }
        Command::Validate { config } => {
            BuildContext::load(&config)?.validate()?;
            tracing::info!("{config} is valid");
            Ok(())
        }
    }
}

/// Parse the provided arguments and execute.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}
