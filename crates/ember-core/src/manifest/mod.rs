//! Immutable in-memory model of a bundle manifest.
//!
//! The model is an arena of entity vectors with integer indices for
//! every cross-reference, built once by [`parse::parse_manifest`] and
//! never mutated afterwards. Transient detect/plan state lives in the
//! engine, keyed by the same indices.

pub mod parse;

use crate::version::Version;

pub type PackageIndex = usize;
pub type PayloadIndex = usize;
pub type ContainerIndex = usize;
pub type BoundaryIndex = usize;

/// Bundle-wide identity and registration inputs.
#[derive(Debug, Clone, Default)]
pub struct BundleInfo {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub per_machine: bool,
    pub provider_key: String,
    pub tag: String,
    pub executable_name: String,
}

/// A manifest-authored variable declaration.
#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub value: Option<String>,
    pub value_type: DeclaredType,
    pub hidden: bool,
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeclaredType {
    #[default]
    String,
    Numeric,
    Version,
}

/// A bracket within which execute failures trigger mirror rollback.
#[derive(Debug, Clone)]
pub struct RollbackBoundary {
    pub id: String,
    pub vital: bool,
}

/// An archive embedded in (or downloaded beside) the bundle that holds
/// several payloads in a fixed stream order.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub source_path: String,
    pub download_url: Option<String>,
    pub size: u64,
    /// Payloads in stream order.
    pub stream: Vec<PayloadIndex>,
}

/// A file a package engine needs at execute time.
#[derive(Debug, Clone)]
pub struct Payload {
    pub key: String,
    /// Path of the staged file relative to the package cache
    /// directory (or the layout directory).
    pub file_path: String,
    pub size: u64,
    pub hash: Option<String>,
    pub catalog: Option<String>,
    pub source_path: String,
    pub download_url: Option<String>,
    /// The owning container, or external (copy/download only).
    pub container: Option<ContainerIndex>,
}

/// A dependency provider key registered on behalf of a package.
#[derive(Debug, Clone)]
pub struct DependencyProvider {
    pub key: String,
    pub version: Option<Version>,
    pub display_name: Option<String>,
}

/// Exit-code mapping for Exe packages. `code: None` is the wildcard.
#[derive(Debug, Clone)]
pub struct ExitCodeMapping {
    pub code: Option<i32>,
    pub behavior: ExitCodeBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCodeBehavior {
    Success,
    Error,
    ScheduleReboot,
    ForceReboot,
}

#[derive(Debug, Clone, Default)]
pub struct ExePackage {
    pub detect_condition: Option<String>,
    pub install_arguments: Option<String>,
    pub repair_arguments: Option<String>,
    pub uninstall_arguments: Option<String>,
    pub repairable: bool,
    pub exit_codes: Vec<ExitCodeMapping>,
}

#[derive(Debug, Clone)]
pub struct MsiProperty {
    pub id: String,
    pub value: String,
    pub rollback_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MsiFeature {
    pub id: String,
    pub add_local_condition: Option<String>,
    pub repair: bool,
}

/// A related-product range used to detect upgrades of other MSIs.
#[derive(Debug, Clone)]
pub struct RelatedMsi {
    pub upgrade_code: String,
    pub min_version: Option<Version>,
    pub max_version: Option<Version>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
    pub only_detect: bool,
    pub languages: Vec<u32>,
    pub lang_inclusive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MsiPackage {
    pub product_code: String,
    pub language: u32,
    pub version: Version,
    pub features: Vec<MsiFeature>,
    pub properties: Vec<MsiProperty>,
    pub related: Vec<RelatedMsi>,
    /// Slipstream patches, as parallel id/index arrays.
    pub slipstream_patch_ids: Vec<String>,
    pub slipstream_patches: Vec<PackageIndex>,
}

#[derive(Debug, Clone)]
pub struct MspTargetProduct {
    pub product_code: String,
    pub order: i32,
    pub slipstream: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MspPackage {
    pub patch_code: String,
    pub applicability_xml: String,
    pub target_products: Vec<MspTargetProduct>,
}

#[derive(Debug, Clone, Default)]
pub struct MsuPackage {
    pub detect_condition: Option<String>,
    pub kb_id: String,
}

/// Kind-specific package data.
#[derive(Debug, Clone)]
pub enum PackageKind {
    Exe(ExePackage),
    Msi(MsiPackage),
    Msp(MspPackage),
    Msu(MsuPackage),
}

impl PackageKind {
    pub fn name(&self) -> &'static str {
        match self {
            PackageKind::Exe(_) => "Exe",
            PackageKind::Msi(_) => "Msi",
            PackageKind::Msp(_) => "Msp",
            PackageKind::Msu(_) => "Msu",
        }
    }
}

/// One installable unit in the chain.
#[derive(Debug, Clone)]
pub struct Package {
    pub id: String,
    pub cache_id: String,
    pub per_machine: bool,
    pub vital: bool,
    pub uninstallable: bool,
    pub install_condition: Option<String>,
    pub rollback_install_condition: Option<String>,
    pub size: u64,
    pub install_size: u64,
    pub payloads: Vec<PayloadIndex>,
    pub dependency_providers: Vec<DependencyProvider>,
    /// Boundary opened when this package is reached going forward
    /// (install/repair ordering).
    pub rollback_boundary_forward: Option<BoundaryIndex>,
    /// Boundary opened when this package is reached going backward
    /// (uninstall ordering).
    pub rollback_boundary_backward: Option<BoundaryIndex>,
    pub log_path_variable: Option<String>,
    pub kind: PackageKind,
}

/// Patch sequence data for an Msp package, parallel-indexed with
/// [`Manifest::patch_to_package`].
#[derive(Debug, Clone)]
pub struct PatchSequenceInfo {
    pub patch_code: String,
    pub applicability_xml: String,
}

/// The parsed bundle manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub bundle: BundleInfo,
    pub variables: Vec<VariableDecl>,
    pub boundaries: Vec<RollbackBoundary>,
    pub containers: Vec<Container>,
    pub payloads: Vec<Payload>,
    pub packages: Vec<Package>,
    /// Patch sequence info across all Msp packages.
    pub patch_info: Vec<PatchSequenceInfo>,
    /// Direct lookup from patch info to the Msp package it describes;
    /// always the exact same length as `patch_info`.
    pub patch_to_package: Vec<PackageIndex>,
}

impl Default for Package {
    fn default() -> Self {
        Self {
            id: String::new(),
            cache_id: String::new(),
            per_machine: false,
            vital: true,
            uninstallable: true,
            install_condition: None,
            rollback_install_condition: None,
            size: 0,
            install_size: 0,
            payloads: Vec::new(),
            dependency_providers: Vec::new(),
            rollback_boundary_forward: None,
            rollback_boundary_backward: None,
            log_path_variable: None,
            kind: PackageKind::Exe(ExePackage::default()),
        }
    }
}

impl Manifest {
    pub fn package_by_id(&self, id: &str) -> Option<(PackageIndex, &Package)> {
        self.packages
            .iter()
            .enumerate()
            .find(|(_, p)| p.id == id)
    }
}
