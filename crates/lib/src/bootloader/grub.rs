//! GRUB for EFI firmware.

use std::os::unix::fs::PermissionsExt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use imagecraft_utils::CommandRunner;

use super::{with_host_mounts, BootConfig};
use crate::error::Error;
use crate::template::{render_asset, Asset};
use crate::verity::{substitute_root_hash_in_file, VerityResult};

const TOOL_DIRS: &[&str] = &["usr/sbin", "usr/bin", "sbin", "bin"];

/// Where the stub `grub.cfg` goes: the removable-media EFI path, and the
/// BIOS-style path some GRUB builds search on the ESP.
const STUB_CONFIG_PATHS: &[&str] = &[
    "boot/efi/EFI/BOOT/grub.cfg",
    "boot/efi/boot/grub2/grub.cfg",
];
const GRUB_CFG: &str = "boot/grub2/grub.cfg";
const GRUBENV: &str = "boot/grub2/grubenv";
const GRUB_DEFAULTS: &str = "etc/default/grub";

/// The environment block is a fixed size, padded with `#`.
const GRUBENV_SIZE: usize = 1024;

/// The GRUB tools of an install root, relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GrubTools {
    pub(crate) install: Utf8PathBuf,
    pub(crate) mkconfig: Utf8PathBuf,
}

fn find_tool(root: &Utf8Path, name: &str) -> Result<Option<Utf8PathBuf>> {
    for dir in TOOL_DIRS {
        let rel = Utf8Path::new(dir).join(name);
        if root.join(&rel).try_exists()? {
            return Ok(Some(rel));
        }
    }
    Ok(None)
}

fn find_first(root: &Utf8Path, names: [&str; 2]) -> Result<Option<Utf8PathBuf>> {
    for name in names {
        if let Some(p) = find_tool(root, name)? {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

/// Find the GRUB tools, preferring the `grub2-` naming.
///
/// The install tool is looked up under the naming of the config tool first,
/// then under the other one.
#[context("Detecting GRUB tools")]
pub(crate) fn detect_tools(root: &Utf8Path) -> Result<GrubTools> {
    let mkconfig =
        find_first(root, ["grub2-mkconfig", "grub-mkconfig"])?.ok_or(Error::NoGrubToolFound)?;
    let install_names = if mkconfig.file_name() == Some("grub2-mkconfig") {
        ["grub2-install", "grub-install"]
    } else {
        ["grub-install", "grub2-install"]
    };
    let Some(install) = find_first(root, install_names)? else {
        return Err(anyhow::Error::from(Error::NoGrubToolFound)
            .context("No grub2-install or grub-install found in install root"));
    };
    tracing::debug!("Using {install} and {mkconfig}");
    Ok(GrubTools { install, mkconfig })
}

fn efi_target() -> Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x86_64-efi"),
        "aarch64" => Ok("arm64-efi"),
        "riscv64" => Ok("riscv64-efi"),
        o => anyhow::bail!("Unsupported architecture for GRUB EFI: {o}"),
    }
}

fn pad_grubenv(mut env: String) -> Result<String> {
    if env.len() > GRUBENV_SIZE {
        anyhow::bail!(
            "Rendered grubenv is {} bytes, larger than {GRUBENV_SIZE}",
            env.len()
        );
    }
    let padding = GRUBENV_SIZE - env.len();
    env.push_str(&"#".repeat(padding));
    Ok(env)
}

fn set_executable(path: &Utf8Path) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Setting permissions of {path}"))
}

fn chroot(root: &Utf8Path, tool: &Utf8Path) -> Command {
    let mut c = Command::new("chroot");
    c.arg(root).arg(Utf8Path::new("/").join(tool));
    c
}

#[context("Installing GRUB")]
pub(crate) fn install(
    cfg: &BootConfig,
    runner: &dyn CommandRunner,
) -> Result<Option<VerityResult>> {
    let root = cfg.install_root;
    let tools = detect_tools(root)?;
    let target = efi_target()?;

    let values = cfg.template_values();
    let stub = render_asset(cfg.ctx, Asset::GrubCfg, &values)?;
    for path in STUB_CONFIG_PATHS {
        cfg.write(path, &stub)?;
    }
    let env = pad_grubenv(render_asset(cfg.ctx, Asset::GrubEnv, &values)?)?;
    cfg.write(GRUBENV, env)?;
    cfg.write(
        GRUB_DEFAULTS,
        render_asset(cfg.ctx, Asset::GrubDefaults, &values)?,
    )?;

    for tool in [&tools.install, &tools.mkconfig] {
        set_executable(&root.join(tool))?;
    }
    with_host_mounts(runner, root, || {
        runner.run_silent(
            chroot(root, &tools.install)
                .arg(format!("--target={target}"))
                .args([
                    "--efi-directory=/boot/efi",
                    "--boot-directory=/boot",
                    "--removable",
                    "--no-nvram",
                ]),
        )?;
        runner.run_silent(
            chroot(root, &tools.mkconfig)
                .arg("-o")
                .arg(Utf8Path::new("/").join(GRUB_CFG)),
        )
    })?;

    let Some(hash) = &cfg.hash else {
        return Ok(None);
    };
    let verity = cfg.provision_verity(runner, hash)?;
    // /boot is outside the protected root, so it can still be written
    substitute_root_hash_in_file(&root.join(GRUB_CFG), &verity.root_hash)?;
    tracing::info!("Installed GRUB with verity root hash {}", verity.root_hash);
    Ok(Some(verity))
}
