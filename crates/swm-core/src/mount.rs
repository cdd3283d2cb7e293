//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Mounting of update images."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::path::Path;
use std::process::Command;

use swm_common::config::{IMAGE_PATH_PLACEHOLDER, MOUNT_POINT_PLACEHOLDER};
use swm_common::StorageConfig;
use tracing::debug;

use crate::error::MountError;

/// Makes an update image's contents visible under a mount point.
pub trait Mounter: Send {
    /// Mount `image` on `mount_point`.
    fn mount(&self, image: &Path, mount_point: &Path) -> Result<(), MountError>;
    /// Release `mount_point`.
    fn unmount(&self, mount_point: &Path) -> Result<(), MountError>;
}

/// Runs external mount and unmount commands built from argv templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMounter {
    mount_command: Vec<String>,
    unmount_command: Vec<String>,
}

impl CommandMounter {
    pub fn new(mount_command: Vec<String>, unmount_command: Vec<String>) -> Self {
        Self {
            mount_command,
            unmount_command,
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(
            storage.mount_command.clone(),
            storage.unmount_command.clone(),
        )
    }

    fn render(template: &[String], image: Option<&Path>, mount_point: &Path) -> Vec<String> {
        let mount_point = mount_point.display().to_string();
        let image = image.map(|p| p.display().to_string()).unwrap_or_default();
        template
            .iter()
            .map(|part| {
                part.replace(IMAGE_PATH_PLACEHOLDER, &image)
                    .replace(MOUNT_POINT_PLACEHOLDER, &mount_point)
            })
            .collect()
    }

    fn run(kind: &'static str, argv: &[String]) -> Result<(), MountError> {
        let (program, args) = argv.split_first().ok_or(MountError::EmptyCommand(kind))?;
        let command = argv.join(" ");
        debug!(command = %command, "running {kind} command");
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|source| MountError::Spawn {
                command: command.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(MountError::Failed { command, status })
        }
    }
}

impl Mounter for CommandMounter {
    fn mount(&self, image: &Path, mount_point: &Path) -> Result<(), MountError> {
        Self::run(
            "mount",
            &Self::render(&self.mount_command, Some(image), mount_point),
        )
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        Self::run(
            "unmount",
            &Self::render(&self.unmount_command, None, mount_point),
        )
    }
}
