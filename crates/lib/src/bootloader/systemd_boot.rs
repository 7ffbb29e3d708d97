//! systemd-boot for EFI firmware.
//!
//! The kernel and initramfs are copied onto the ESP next to a Type #1 boot
//! entry.  With a verity-protected root, a unified kernel image carrying the
//! final command line is built as well and becomes the default entry.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use imagecraft_utils::CommandRunner;

use super::BootConfig;
use crate::kernel::find_kernel;
use crate::template::{render_asset, Asset};
use crate::uki::{build_uki, UkiInputs};
use crate::verity::{substitute_root_hash_in_file, with_scratch_mounts, VerityResult};

const ESP: &str = "boot/efi";
const ENTRIES_DIR: &str = "boot/efi/loader/entries";
const LOADER_CONF: &str = "boot/efi/loader/loader.conf";
const UKI_DIR: &str = "boot/efi/EFI/Linux";
/// Lives on the scratch tmpfs, never in the protected root filesystem
const CMDLINE_FILE: &str = "tmp/cmdline";

/// The boot entry name: the hostname, or `linux`.
fn entry_id<'a>(cfg: &'a BootConfig<'_>) -> &'a str {
    match cfg.ctx.system.hostname.as_str() {
        "" => "linux",
        h => h,
    }
}

#[context("Installing systemd-boot")]
pub(crate) fn install(
    cfg: &BootConfig,
    runner: &dyn CommandRunner,
) -> Result<Option<VerityResult>> {
    let root = cfg.install_root;
    let kernel = find_kernel(root, &cfg.ctx.system.kernel)?;
    let id = entry_id(cfg);

    let esp = Utf8Path::new(ESP);
    let mut esp_names = Vec::new();
    for src in [&kernel.kernel, &kernel.initrd] {
        let name = src
            .file_name()
            .with_context(|| format!("No file name in {src}"))?;
        cfg.copy(src, &esp.join(name))?;
        esp_names.push(name.to_string());
    }

    let mut values = cfg.template_values();
    let title = match kernel.version() {
        Some(v) => format!("{id} {v}"),
        None => id.to_string(),
    };
    values.insert("Title", title);
    values.insert("Kernel", esp_names[0].clone());
    values.insert("Initrd", esp_names[1].clone());
    let default_entry = if cfg.hash.is_some() {
        format!("{id}.efi")
    } else {
        format!("{id}.conf")
    };
    values.insert("DefaultEntry", default_entry);

    let entry = Utf8Path::new(ENTRIES_DIR).join(format!("{id}.conf"));
    cfg.write(&entry, render_asset(cfg.ctx, Asset::BootParams, &values)?)?;
    cfg.write(LOADER_CONF, render_asset(cfg.ctx, Asset::LoaderConf, &values)?)?;

    runner.run_silent(
        Command::new("bootctl")
            .arg("install")
            .arg(format!("--root={root}"))
            .args(["--esp-path=/boot/efi", "--no-variables"]),
    )?;

    let Some(hash) = &cfg.hash else {
        return Ok(None);
    };
    let signing = cfg.ctx.system.immutability.signing_keys();
    let verity = with_scratch_mounts(runner, root, || {
        let cmdline_file = root.join(CMDLINE_FILE);
        std::fs::write(&cmdline_file, cfg.cmdline.to_string())
            .with_context(|| format!("Writing {cmdline_file}"))?;
        let verity = cfg.provision_verity(runner, hash)?;
        substitute_root_hash_in_file(&cmdline_file, &verity.root_hash)?;
        substitute_root_hash_in_file(&root.join(&entry), &verity.root_hash)?;
        build_uki(
            runner,
            &UkiInputs {
                kernel: &root.join(&kernel.kernel),
                initrd: &root.join(&kernel.initrd),
                cmdline_file: &cmdline_file,
                output: &root.join(UKI_DIR).join(format!("{id}.efi")),
                signing: signing.as_ref(),
                tmpdir: Some(&root.join(ESP).join("tmp")),
            },
        )?;
        Ok(verity)
    })?;
    Ok(Some(verity))
}
