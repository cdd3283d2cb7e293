//! ---
//! swm_section: "01-core-functionality"
//! swm_subsection: "module"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Operation descriptor table."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
//! Static registry mapping each operation type to the executor service,
//! method and ordered argument list it is dispatched with.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use swm_common::OperationsConfig;
use swm_msg::ArgValue;

/// Package installer service.
pub const PACKAGE_MANAGER: &str = "org.genivi.PackageManager";
/// Component lifecycle service.
pub const LIFECYCLE_MANAGER: &str = "org.genivi.LifecycleManager";
/// Disk partition service.
pub const PARTITION_MANAGER: &str = "org.genivi.PartitionManager";
/// Firmware loader for ECU 1.
pub const MODULE_LOADER_ECU1: &str = "org.genivi.ModuleLoaderEcu1";

/// Argument that is rewritten relative to the mount point.
pub const IMAGE_ARGUMENT: &str = "image";

/// Every operation type a manifest may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    InstallPackage,
    UpgradePackage,
    RemovePackage,
    StartComponents,
    StopComponents,
    Reboot,
    CreateDiskPartition,
    ResizeDiskPartition,
    DeleteDiskPartition,
    WriteDiskPartition,
    PatchDiskPartition,
    FlashModuleFirmwareEcu1,
}

impl OperationType {
    /// All operation types in table order.
    pub const ALL: [OperationType; 12] = [
        OperationType::InstallPackage,
        OperationType::UpgradePackage,
        OperationType::RemovePackage,
        OperationType::StartComponents,
        OperationType::StopComponents,
        OperationType::Reboot,
        OperationType::CreateDiskPartition,
        OperationType::ResizeDiskPartition,
        OperationType::DeleteDiskPartition,
        OperationType::WriteDiskPartition,
        OperationType::PatchDiskPartition,
        OperationType::FlashModuleFirmwareEcu1,
    ];

    /// Parse a manifest key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == key)
    }

    /// Manifest key for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::InstallPackage => "installPackage",
            OperationType::UpgradePackage => "upgradePackage",
            OperationType::RemovePackage => "removePackage",
            OperationType::StartComponents => "startComponents",
            OperationType::StopComponents => "stopComponents",
            OperationType::Reboot => "reboot",
            OperationType::CreateDiskPartition => "createDiskPartition",
            OperationType::ResizeDiskPartition => "resizeDiskPartition",
            OperationType::DeleteDiskPartition => "deleteDiskPartition",
            OperationType::WriteDiskPartition => "writeDiskPartition",
            OperationType::PatchDiskPartition => "patchDiskPartition",
            OperationType::FlashModuleFirmwareEcu1 => "flashModuleFirmwareEcu1",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire type of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Int,
    Bool,
    StrList,
}

impl ArgKind {
    /// Description used in `InvalidField` errors.
    pub fn expected(self) -> &'static str {
        match self {
            ArgKind::Str => "a string",
            ArgKind::Int => "an integer",
            ArgKind::Bool => "a boolean",
            ArgKind::StrList => "a list of strings",
        }
    }
}

/// One entry of a descriptor's argument list. `default == None` marks a
/// mandatory field.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub default: Option<ArgValue>,
}

impl ArgSpec {
    fn required(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            default: None,
        }
    }

    fn optional(name: &'static str, default: ArgValue) -> Self {
        let kind = match &default {
            ArgValue::Str(_) => ArgKind::Str,
            ArgValue::Int(_) => ArgKind::Int,
            ArgValue::Bool(_) => ArgKind::Bool,
            ArgValue::StrList(_) | ArgValue::Results(_) => ArgKind::StrList,
        };
        Self {
            name,
            kind,
            default: Some(default),
        }
    }
}

/// What to do with the rest of a manifest when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    Abort,
    Continue,
}

/// Scheduling defaults applied when the manifest record omits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduling {
    pub time_estimate_ms: u64,
    pub on_failure: OnFailure,
}

impl Default for Scheduling {
    fn default() -> Self {
        Self {
            time_estimate_ms: 0,
            on_failure: OnFailure::Continue,
        }
    }
}

/// Target and argument layout of one operation type.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub operation: OperationType,
    pub service: &'static str,
    pub method: &'static str,
    pub args: Vec<ArgSpec>,
    pub scheduling: Scheduling,
}

/// Descriptor table with configuration-supplied defaults (blacklists,
/// downgrade policy) baked in.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorTable {
    entries: IndexMap<OperationType, OperationDescriptor>,
}

impl DescriptorTable {
    /// Build the table for the given operation defaults.
    pub fn new(defaults: &OperationsConfig) -> Self {
        use ArgKind::{Int, Str, StrList};

        let packages = || {
            ArgSpec::optional(
                "blacklistedPackages",
                ArgValue::StrList(defaults.blacklisted_packages.clone()),
            )
        };
        let partitions = || {
            ArgSpec::optional(
                "blacklistedPartitions",
                ArgValue::StrList(defaults.blacklisted_partitions.clone()),
            )
        };
        let firmware = || {
            ArgSpec::optional(
                "blacklistedFirmware",
                ArgValue::StrList(defaults.blacklisted_firmware.clone()),
            )
        };
        let downgrade =
            || ArgSpec::optional("allowDowngrade", ArgValue::Bool(defaults.allow_downgrade));
        let image = || ArgSpec::required(IMAGE_ARGUMENT, Str);
        let disk = || ArgSpec::required("disk", Str);
        let partition = || ArgSpec::required("partitionNumber", Int);
        let empty = || ArgValue::Str(String::new());

        #[rustfmt::skip]
        let table = [
            (OperationType::InstallPackage,          PACKAGE_MANAGER,    "installPackage",      vec![image(), packages()]),
            (OperationType::UpgradePackage,          PACKAGE_MANAGER,    "upgradePackage",      vec![image(), packages(), downgrade()]),
            (OperationType::RemovePackage,           PACKAGE_MANAGER,    "removePackage",       vec![ArgSpec::required("packageId", Str)]),
            (OperationType::StartComponents,         LIFECYCLE_MANAGER,  "startComponents",     vec![ArgSpec::required("components", StrList)]),
            (OperationType::StopComponents,          LIFECYCLE_MANAGER,  "stopComponents",      vec![ArgSpec::required("components", StrList)]),
            (OperationType::Reboot,                  LIFECYCLE_MANAGER,  "reboot",              vec![ArgSpec::optional("bootParameters", empty())]),
            (OperationType::CreateDiskPartition,     PARTITION_MANAGER,  "createDiskPartition", vec![
                disk(),
                partition(),
                ArgSpec::required("type", Int),
                ArgSpec::required("start", Int),
                ArgSpec::required("size", Int),
                ArgSpec::optional("guid", empty()),
                ArgSpec::optional("name", empty()),
            ]),
            (OperationType::ResizeDiskPartition,     PARTITION_MANAGER,  "resizeDiskPartition", vec![
                disk(),
                partition(),
                ArgSpec::required("start", Int),
                ArgSpec::required("size", Int),
            ]),
            (OperationType::DeleteDiskPartition,     PARTITION_MANAGER,  "deleteDiskPartition", vec![disk(), partition()]),
            (OperationType::WriteDiskPartition,      PARTITION_MANAGER,  "writeDiskPartition",  vec![disk(), partition(), image(), partitions()]),
            (OperationType::PatchDiskPartition,      PARTITION_MANAGER,  "patchDiskPartition",  vec![disk(), partition(), image(), partitions()]),
            (OperationType::FlashModuleFirmwareEcu1, MODULE_LOADER_ECU1, "flashModuleFirmware", vec![image(), firmware(), downgrade()]),
        ];

        let entries = table
            .into_iter()
            .map(|(operation, service, method, args)| {
                (
                    operation,
                    OperationDescriptor {
                        operation,
                        service,
                        method,
                        args,
                        scheduling: Scheduling::default(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Look up a descriptor by its manifest key.
    pub fn resolve(&self, operation: &str) -> Option<&OperationDescriptor> {
        OperationType::from_key(operation).and_then(|op| self.entries.get(&op))
    }

    /// Descriptor of a known operation type.
    pub fn get(&self, operation: OperationType) -> Option<&OperationDescriptor> {
        self.entries.get(&operation)
    }

    /// Copy of the table with the `allowDowngrade` default replaced.
    pub fn with_allow_downgrade(&self, allow: bool) -> Self {
        let mut table = self.clone();
        for descriptor in table.entries.values_mut() {
            for spec in &mut descriptor.args {
                if spec.name == "allowDowngrade" {
                    spec.default = Some(ArgValue::Bool(allow));
                }
            }
        }
        table
    }

    /// Descriptors in table order.
    pub fn iter(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operation_type_has_a_descriptor() {
        let table = DescriptorTable::new(&OperationsConfig::default());
        for op in OperationType::ALL {
            let descriptor = table.resolve(op.as_str()).expect("descriptor");
            assert_eq!(descriptor.operation, op);
        }
        assert_eq!(table.iter().count(), OperationType::ALL.len());
        assert!(table.resolve("formatDisk").is_none());
    }

    #[test]
    fn install_package_layout() {
        let table = DescriptorTable::new(&OperationsConfig::default());
        let install = table.get(OperationType::InstallPackage).unwrap();
        assert_eq!(install.service, PACKAGE_MANAGER);
        assert_eq!(install.method, "installPackage");
        let names: Vec<_> = install.args.iter().map(|a| a.name).collect();
        assert_eq!(names, ["image", "blacklistedPackages"]);
        assert_eq!(install.args[0].default, None);
        assert_eq!(install.args[1].default, Some(ArgValue::StrList(Vec::new())));
        assert_eq!(install.scheduling, Scheduling::default());
    }

    #[test]
    fn defaults_follow_configuration() {
        let config = OperationsConfig {
            blacklisted_partitions: vec!["/dev/sda1".into()],
            allow_downgrade: true,
            ..OperationsConfig::default()
        };
        let table = DescriptorTable::new(&config);
        let write = table.get(OperationType::WriteDiskPartition).unwrap();
        assert_eq!(
            write.args.last().unwrap().default,
            Some(ArgValue::StrList(vec!["/dev/sda1".into()]))
        );

        let flash = table.get(OperationType::FlashModuleFirmwareEcu1).unwrap();
        assert_eq!(flash.method, "flashModuleFirmware");
        assert_eq!(flash.args[2].default, Some(ArgValue::Bool(true)));

        let strict = table.with_allow_downgrade(false);
        let flash = strict.get(OperationType::FlashModuleFirmwareEcu1).unwrap();
        assert_eq!(flash.args[2].default, Some(ArgValue::Bool(false)));
    }

    #[test]
    fn scheduling_defaults_to_zero_estimate_and_continue() {
        let table = DescriptorTable::new(&OperationsConfig::default());
        let reboot = table.get(OperationType::Reboot).unwrap();
        assert_eq!(reboot.scheduling.time_estimate_ms, 0);
        assert_eq!(reboot.scheduling.on_failure, OnFailure::Continue);
        assert_eq!(reboot.args[0].default, Some(ArgValue::Str(String::new())));
    }
}
