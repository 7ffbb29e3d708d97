//! Named failures of the image assembly core.
//!
//! These are carried inside [`anyhow::Error`], either as the error itself or
//! as a context layer wrapping the underlying tool failure, and can be
//! recovered with `downcast_ref::<Error>()` through any number of further
//! context layers.

use camino::Utf8PathBuf;

use crate::config::PartitionTableType;

/// A named failure of image assembly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The build configuration violates an invariant
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A partition's semantic type has no identifier in the table type
    #[error("Unknown partition type {name:?} for {table} partition table")]
    UnknownPartitionType {
        /// The semantic type
        name: String,
        /// The partition table type
        table: PartitionTableType,
    },
    /// Creating a partition or its filesystem failed
    #[error("Creating partition {index} ({id}) failed")]
    PartitionFailed {
        /// Zero-based position of the partition in the layout
        index: usize,
        /// The partition id
        id: String,
    },
    /// No partition is mapped to the `/` mount point
    #[error("Root partition not found")]
    RootPartitionNotFound,
    /// Querying a filesystem UUID failed
    #[error("Failed to retrieve UUID of {0}")]
    UuidRetrievalFailed(Utf8PathBuf),
    /// Querying a partition UUID failed
    #[error("Failed to retrieve PARTUUID of {0}")]
    PartUuidRetrievalFailed(Utf8PathBuf),
    /// The bootloader provider is not one we know
    #[error("Unsupported bootloader provider {0:?}")]
    UnsupportedBootloaderProvider(String),
    /// systemd-boot was requested with a legacy boot type
    #[error("systemd-boot requires EFI boot")]
    SystemdBootRequiresEfi,
    /// GRUB was requested with a legacy boot type
    #[error("Legacy boot mode is not implemented")]
    LegacyModeNotImplemented,
    /// Neither `grub2-mkconfig` nor `grub-mkconfig` exists in the install root
    #[error("No grub2-mkconfig or grub-mkconfig found in install root")]
    NoGrubToolFound,
    /// Immutability is enabled but there is no usable hash partition
    #[error("Verity hash partition not found")]
    VerityHashPartitionNotFound,
    /// Querying the UUID or PARTUUID of the hash partition failed
    #[error("Failed to retrieve identifiers of hash partition {0}")]
    HashPartitionUuidFailed(Utf8PathBuf),
    /// GRUB with immutability needs a `/boot` partition outside the verity root
    #[error("Immutability with GRUB requires a separate /boot partition")]
    VerityRequiresSeparateBoot,
    /// The verity format tool failed or printed no root hash
    #[error("Verity format failed: {0}")]
    VerityFormatFailed(String),
    /// The unified kernel image assembly tool failed
    #[error("Building unified kernel image failed")]
    UkiBuildFailed,
    /// No kernel or initramfs could be found
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),
    /// A template references a placeholder with no value
    #[error("Rendering template {template}: unknown placeholder {placeholder:?}")]
    TemplateRender {
        /// The template name
        template: String,
        /// The unresolved placeholder
        placeholder: String,
    },
}

/// Returns the named failure carried in `e`, if any.
pub fn kind(e: &anyhow::Error) -> Option<&Error> {
    e.downcast_ref::<Error>()
}
