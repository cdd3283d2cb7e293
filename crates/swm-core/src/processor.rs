//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Image queue and mount lifecycle."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use swm_common::StorageConfig;
use swm_msg::Transport;
use swm_persistence::Store;
use tracing::{error, info, warn};

use crate::descriptor::DescriptorTable;
use crate::manifest::{Dispatch, Manifest, TransactionIds};
use crate::mount::Mounter;

/// Queue of downloaded update images, mounted and loaded one at a time.
pub struct ManifestProcessor {
    images: VecDeque<PathBuf>,
    mounter: Box<dyn Mounter>,
    store: Store,
    table: DescriptorTable,
    mount_root: PathBuf,
    manifest_file: String,
    transactions: TransactionIds,
    mount_point: Option<PathBuf>,
    current: Option<Manifest>,
}

impl ManifestProcessor {
    pub fn new(
        storage: &StorageConfig,
        table: DescriptorTable,
        store: Store,
        mounter: Box<dyn Mounter>,
    ) -> Self {
        Self {
            images: VecDeque::new(),
            mounter,
            store,
            table,
            mount_root: storage.mount_root.clone(),
            manifest_file: storage.manifest_file.clone(),
            transactions: TransactionIds::default(),
            mount_point: None,
            current: None,
        }
    }

    /// Append an image; images are processed in arrival order.
    pub fn queue_image(&mut self, image: impl Into<PathBuf>) {
        let image = image.into();
        info!(image = %image.display(), queued = self.images.len() + 1, "update image queued");
        self.images.push_front(image);
    }

    /// Images waiting to be mounted.
    pub fn pending_images(&self) -> usize {
        self.images.len()
    }

    pub fn current_manifest(&self) -> Option<&Manifest> {
        self.current.as_ref()
    }

    pub fn current_manifest_mut(&mut self) -> Option<&mut Manifest> {
        self.current.as_mut()
    }

    /// Mount point of the image currently mounted, if any.
    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Release the current image and load the next queued one.
    ///
    /// Returns `false` when the queue is empty or the popped image could
    /// not be mounted or its manifest could not be loaded. A failed image
    /// is not retried.
    pub fn load_next_manifest(&mut self) -> bool {
        self.release();

        let Some(image) = self.images.pop_back() else {
            info!("image queue is empty");
            return false;
        };

        let mount_point = self.mount_root.join(std::process::id().to_string());
        if let Err(err) = fs::create_dir_all(&mount_point) {
            warn!(mount_point = %mount_point.display(), error = %err, "failed to create mount point");
        }

        if let Err(err) = self.mounter.mount(&image, &mount_point) {
            error!(
                image = %image.display(),
                mount_point = %mount_point.display(),
                error = %err,
                "failed to mount update image"
            );
            self.unmount_quietly(&mount_point);
            return false;
        }
        info!(image = %image.display(), mount_point = %mount_point.display(), "update image mounted");

        let manifest_path = mount_point.join(&self.manifest_file);
        match Manifest::load_from_file(&manifest_path, &mount_point, &self.table, &self.store) {
            Ok(manifest) => {
                self.mount_point = Some(mount_point);
                self.current = Some(manifest);
                true
            }
            Err(err) => {
                error!(
                    image = %image.display(),
                    manifest = %manifest_path.display(),
                    error = %err,
                    "failed to load manifest"
                );
                self.unmount_quietly(&mount_point);
                false
            }
        }
    }

    /// Dispatch the next operation of the current manifest.
    pub fn dispatch_next(&mut self, transport: &dyn Transport, now: Instant) -> Dispatch {
        match self.current.as_mut() {
            Some(manifest) => manifest.start_next_operation(transport, &mut self.transactions, now),
            None => Dispatch::Exhausted,
        }
    }

    /// Drop the current manifest and unmount its image. Unmount failures
    /// are logged and otherwise ignored.
    pub fn release(&mut self) {
        self.current = None;
        if let Some(mount_point) = self.mount_point.take() {
            match self.mounter.unmount(&mount_point) {
                Ok(()) => info!(mount_point = %mount_point.display(), "update image unmounted"),
                Err(err) => warn!(mount_point = %mount_point.display(), error = %err, "failed to unmount update image"),
            }
        }
    }

    fn unmount_quietly(&self, mount_point: &Path) {
        if let Err(err) = self.mounter.unmount(mount_point) {
            warn!(mount_point = %mount_point.display(), error = %err, "cleanup unmount failed");
        }
    }
}

impl std::fmt::Debug for ManifestProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestProcessor")
            .field("images", &self.images)
            .field("mount_point", &self.mount_point)
            .field("current", &self.current.as_ref().map(Manifest::update_id))
            .finish_non_exhaustive()
    }
}
