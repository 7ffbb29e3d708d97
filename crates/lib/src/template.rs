//! Boot configuration templates.
//!
//! Templates contain named placeholders of the form `{{.Name}}`.  Built-in
//! defaults are compiled in; a build context's `assets-dir` may override any
//! of them by file name.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use fn_error_context::context;
use regex::Regex;

use crate::config::BuildContext;
use crate::error::Error;

/// A boot configuration template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    /// The GRUB stub configuration placed on the ESP
    GrubCfg,
    /// The GRUB environment block
    GrubEnv,
    /// `/etc/default/grub`
    GrubDefaults,
    /// A systemd-boot Type #1 entry
    BootParams,
    /// systemd-boot `loader.conf`
    LoaderConf,
}

impl Asset {
    /// The file name under the assets directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Asset::GrubCfg => "grub.cfg",
            Asset::GrubEnv => "grubenv",
            Asset::GrubDefaults => "grub",
            Asset::BootParams => "bootParams.conf",
            Asset::LoaderConf => "loader.conf",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            Asset::GrubCfg => include_str!("../assets/grub.cfg"),
            Asset::GrubEnv => include_str!("../assets/grubenv"),
            Asset::GrubDefaults => include_str!("../assets/grub"),
            Asset::BootParams => include_str!("../assets/bootParams.conf"),
            Asset::LoaderConf => include_str!("../assets/loader.conf"),
        }
    }

    /// The template text: the override from the assets directory if there is
    /// one, else the built-in default.
    #[context("Loading template {}", self.file_name())]
    pub fn load(&self, ctx: &BuildContext) -> Result<String> {
        if let Some(dir) = ctx.assets_dir.as_deref() {
            let path = dir.join(self.file_name());
            if path.try_exists()? {
                tracing::debug!("Using template override {path}");
                return std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"));
            }
        }
        Ok(self.builtin().to_string())
    }
}

/// Placeholder values for a template.
pub type Values<'a> = BTreeMap<&'a str, String>;

/// Substitute every `{{.Name}}` placeholder in `template`.
///
/// A placeholder without a value is an error, so that a typo never silently
/// renders to an empty string.
pub fn render(name: &str, template: &str, values: &Values) -> Result<String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX
        .get_or_init(|| Regex::new(r"\{\{\s*\.([A-Za-z][A-Za-z0-9_]*)\s*\}\}").unwrap());
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in regex.captures_iter(template) {
        let (Some(m), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(v) = values.get(key.as_str()) else {
            return Err(Error::TemplateRender {
                template: name.to_string(),
                placeholder: key.as_str().to_string(),
            }
            .into());
        };
        out.push_str(&template[last..m.start()]);
        out.push_str(v);
        last = m.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Load and render `asset`.
pub fn render_asset(ctx: &BuildContext, asset: Asset, values: &Values) -> Result<String> {
    let template = asset.load(ctx)?;
    render(asset.file_name(), &template, values)
}
