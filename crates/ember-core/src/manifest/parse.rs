//! Bundle manifest parsing.
//!
//! The manifest is parsed in a single event pass that builds the
//! entity arenas with string references, followed by a resolution
//! pass that turns every cross-reference into an index. The first
//! error aborts the parse; no partial manifests escape.

use std::collections::HashMap;

use quick_xml::{events::BytesStart, Reader};
use tracing::debug;

use super::{
    BundleInfo, Container, DeclaredType, DependencyProvider, ExePackage, ExitCodeBehavior,
    ExitCodeMapping, Manifest, MsiFeature, MsiPackage, MsiProperty, MspPackage,
    MspTargetProduct, MsuPackage, Package, PackageKind, PatchSequenceInfo, Payload,
    RelatedMsi, RollbackBoundary, VariableDecl,
};
use crate::error::{EmberError, EmberResult};

struct PendingPackage {
    package: Package,
    payload_refs: Vec<String>,
    boundary_forward: Option<String>,
    boundary_backward: Option<String>,
}

struct ParseState {
    manifest: Manifest,
    packages: Vec<PendingPackage>,
    payload_container: Vec<Option<String>>,
    container_streams: Vec<Vec<String>>,
    current_related: Option<RelatedMsi>,
}

/// Parses a bundle manifest document.
pub fn parse_manifest(xml: &str) -> EmberResult<Manifest> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut state = ParseState {
        manifest: Manifest::default(),
        packages: Vec::new(),
        payload_container: Vec::new(),
        container_streams: Vec::new(),
        current_related: None,
    };

    // element stack tracks which parent an embedded element belongs to
    let mut stack: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event()? {
            quick_xml::events::Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                handle_element(&mut state, &e, &stack)?;
                stack.push(name);
            }
            quick_xml::events::Event::Empty(e) => {
                handle_element(&mut state, &e, &stack)?;
                if e.name().as_ref() == b"RelatedPackage" {
                    finish_related(&mut state)?;
                }
            }
            quick_xml::events::Event::End(e) => {
                if e.name().as_ref() == b"RelatedPackage" {
                    finish_related(&mut state)?;
                }
                stack.pop();
            }
            quick_xml::events::Event::Eof => break,
            _ => {}
        }
    }

    resolve(state)
}

fn handle_element(
    state: &mut ParseState,
    e: &BytesStart<'_>,
    stack: &[Vec<u8>],
) -> EmberResult<()> {
    let attrs = collect_attrs(e)?;
    let parent = stack.last().map(|v| v.as_slice());

    match e.name().as_ref() {
        b"BundleManifest" => parse_bundle(state, &attrs)?,
        b"Variable" => state.manifest.variables.push(parse_variable(&attrs)?),
        b"RollbackBoundary" => state.manifest.boundaries.push(RollbackBoundary {
            id: required(&attrs, "Id", "RollbackBoundary")?,
            vital: flag(&attrs, "Vital", true),
        }),
        b"Container" => {
            state.manifest.containers.push(Container {
                id: required(&attrs, "Id", "Container")?,
                source_path: attrs.get("FilePath").cloned().unwrap_or_default(),
                download_url: attrs.get("DownloadUrl").cloned(),
                size: number(&attrs, "Size", 0),
                stream: Vec::new(),
            });
            state.container_streams.push(Vec::new());
        }
        b"Payload" => {
            state.manifest.payloads.push(Payload {
                key: required(&attrs, "Id", "Payload")?,
                file_path: required(&attrs, "FilePath", "Payload")?,
                size: number(&attrs, "Size", 0),
                hash: attrs.get("Hash").cloned(),
                catalog: attrs.get("Catalog").cloned(),
                source_path: attrs
                    .get("SourcePath")
                    .cloned()
                    .unwrap_or_default(),
                download_url: attrs.get("DownloadUrl").cloned(),
                container: None,
            });
            state.payload_container.push(attrs.get("Container").cloned());
        }
        b"ExePackage" => {
            let kind = PackageKind::Exe(ExePackage {
                detect_condition: attrs.get("DetectCondition").cloned(),
                install_arguments: attrs.get("InstallArguments").cloned(),
                repair_arguments: attrs.get("RepairArguments").cloned(),
                uninstall_arguments: attrs.get("UninstallArguments").cloned(),
                repairable: flag(&attrs, "Repairable", false),
                exit_codes: Vec::new(),
            });
            push_package(state, &attrs, kind)?;
        }
        b"MsiPackage" => {
            let kind = PackageKind::Msi(MsiPackage {
                product_code: required(&attrs, "ProductCode", "MsiPackage")?,
                language: number(&attrs, "Language", 0) as u32,
                version: attrs
                    .get("Version")
                    .map(|v| v.parse())
                    .transpose()?
                    .unwrap_or_default(),
                features: Vec::new(),
                properties: Vec::new(),
                related: Vec::new(),
                slipstream_patch_ids: Vec::new(),
                slipstream_patches: Vec::new(),
            });
            push_package(state, &attrs, kind)?;
        }
        b"MspPackage" => {
            let kind = PackageKind::Msp(MspPackage {
                patch_code: required(&attrs, "PatchCode", "MspPackage")?,
                applicability_xml: attrs
                    .get("ApplicabilityXml")
                    .cloned()
                    .unwrap_or_default(),
                target_products: Vec::new(),
            });
            push_package(state, &attrs, kind)?;
        }
        b"MsuPackage" => {
            let kind = PackageKind::Msu(MsuPackage {
                detect_condition: attrs.get("DetectCondition").cloned(),
                kb_id: attrs.get("KB").cloned().unwrap_or_default(),
            });
            push_package(state, &attrs, kind)?;
        }
        b"PayloadRef" => {
            let id = required(&attrs, "Id", "PayloadRef")?;
            match parent {
                Some(b"Container") => {
                    let index = state.container_streams.len() - 1;
                    state.container_streams[index].push(id);
                }
                Some(b"ExePackage" | b"MsiPackage" | b"MspPackage" | b"MsuPackage") => {
                    current_package(state, "PayloadRef")?.payload_refs.push(id);
                }
                _ => {
                    return Err(EmberError::Manifest(
                        "PayloadRef outside Container or package".to_string(),
                    ))
                }
            }
        }
        b"Provides" => {
            current_package(state, "Provides")?
                .package
                .dependency_providers
                .push(DependencyProvider {
                    key: required(&attrs, "Key", "Provides")?,
                    version: attrs.get("Version").map(|v| v.parse()).transpose()?,
                    display_name: attrs.get("DisplayName").cloned(),
                });
        }
        b"ExitCode" => {
            let code = match attrs.get("Code").map(String::as_str) {
                None | Some("*") => None,
                Some(code) => Some(code.parse::<i32>().map_err(|_| {
                    EmberError::Manifest(format!("invalid exit code '{code}'"))
                })?),
            };
            let behavior = match attrs.get("Behavior").map(String::as_str) {
                Some("success") | None => ExitCodeBehavior::Success,
                Some("error") => ExitCodeBehavior::Error,
                Some("scheduleReboot") => ExitCodeBehavior::ScheduleReboot,
                Some("forceReboot") => ExitCodeBehavior::ForceReboot,
                Some(other) => {
                    return Err(EmberError::Manifest(format!(
                        "invalid exit code behavior '{other}'"
                    )))
                }
            };
            match &mut current_package(state, "ExitCode")?.package.kind {
                PackageKind::Exe(exe) => exe.exit_codes.push(ExitCodeMapping { code, behavior }),
                _ => {
                    return Err(EmberError::Manifest(
                        "ExitCode only applies to ExePackage".to_string(),
                    ))
                }
            }
        }
        b"MsiProperty" => {
            match &mut current_package(state, "MsiProperty")?.package.kind {
                PackageKind::Msi(msi) => msi.properties.push(MsiProperty {
                    id: required(&attrs, "Id", "MsiProperty")?,
                    value: attrs.get("Value").cloned().unwrap_or_default(),
                    rollback_value: attrs.get("RollbackValue").cloned(),
                }),
                _ => {
                    return Err(EmberError::Manifest(
                        "MsiProperty only applies to MsiPackage".to_string(),
                    ))
                }
            }
        }
        b"MsiFeature" => {
            match &mut current_package(state, "MsiFeature")?.package.kind {
                PackageKind::Msi(msi) => msi.features.push(MsiFeature {
                    id: required(&attrs, "Id", "MsiFeature")?,
                    add_local_condition: attrs.get("AddLocalCondition").cloned(),
                    repair: flag(&attrs, "Repair", false),
                }),
                _ => {
                    return Err(EmberError::Manifest(
                        "MsiFeature only applies to MsiPackage".to_string(),
                    ))
                }
            }
        }
        b"RelatedPackage" => {
            state.current_related = Some(RelatedMsi {
                upgrade_code: required(&attrs, "UpgradeCode", "RelatedPackage")?,
                min_version: attrs.get("MinVersion").map(|v| v.parse()).transpose()?,
                max_version: attrs.get("MaxVersion").map(|v| v.parse()).transpose()?,
                min_inclusive: flag(&attrs, "MinInclusive", true),
                max_inclusive: flag(&attrs, "MaxInclusive", false),
                only_detect: flag(&attrs, "OnlyDetect", false),
                languages: Vec::new(),
                lang_inclusive: flag(&attrs, "LangInclusive", true),
            });
        }
        b"Language" => {
            let related = state.current_related.as_mut().ok_or_else(|| {
                EmberError::Manifest("Language outside RelatedPackage".to_string())
            })?;
            related.languages.push(number(&attrs, "Id", 0) as u32);
        }
        b"SlipstreamMsp" => {
            match &mut current_package(state, "SlipstreamMsp")?.package.kind {
                PackageKind::Msi(msi) => {
                    msi.slipstream_patch_ids
                        .push(required(&attrs, "Id", "SlipstreamMsp")?);
                }
                _ => {
                    return Err(EmberError::Manifest(
                        "SlipstreamMsp only applies to MsiPackage".to_string(),
                    ))
                }
            }
        }
        b"TargetProduct" => {
            match &mut current_package(state, "TargetProduct")?.package.kind {
                PackageKind::Msp(msp) => msp.target_products.push(MspTargetProduct {
                    product_code: required(&attrs, "ProductCode", "TargetProduct")?,
                    order: number(&attrs, "Order", 0) as i32,
                    slipstream: flag(&attrs, "Slipstream", false),
                }),
                _ => {
                    return Err(EmberError::Manifest(
                        "TargetProduct only applies to MspPackage".to_string(),
                    ))
                }
            }
        }
        other => {
            debug!(
                element = %String::from_utf8_lossy(other),
                "ignoring unknown manifest element"
            );
        }
    }

    Ok(())
}

fn parse_bundle(state: &mut ParseState, attrs: &HashMap<String, String>) -> EmberResult<()> {
    state.manifest.bundle = BundleInfo {
        id: required(attrs, "Id", "BundleManifest")?,
        name: attrs.get("Name").cloned().unwrap_or_default(),
        version: attrs
            .get("Version")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default(),
        per_machine: flag(attrs, "PerMachine", false),
        provider_key: attrs.get("ProviderKey").cloned().unwrap_or_default(),
        tag: attrs.get("Tag").cloned().unwrap_or_default(),
        executable_name: attrs
            .get("ExecutableName")
            .cloned()
            .unwrap_or_else(|| "setup".to_string()),
    };
    Ok(())
}

fn parse_variable(attrs: &HashMap<String, String>) -> EmberResult<VariableDecl> {
    let value_type = match attrs.get("Type").map(String::as_str) {
        None | Some("string") => DeclaredType::String,
        Some("numeric") => DeclaredType::Numeric,
        Some("version") => DeclaredType::Version,
        Some(other) => {
            return Err(EmberError::Manifest(format!(
                "invalid variable type '{other}'"
            )))
        }
    };
    Ok(VariableDecl {
        name: required(attrs, "Id", "Variable")?,
        value: attrs.get("Value").cloned(),
        value_type,
        hidden: flag(attrs, "Hidden", false),
        persisted: flag(attrs, "Persisted", false),
    })
}

fn push_package(
    state: &mut ParseState,
    attrs: &HashMap<String, String>,
    kind: PackageKind,
) -> EmberResult<()> {
    let id = required(attrs, "Id", kind.name())?;
    let package = Package {
        cache_id: attrs.get("CacheId").cloned().unwrap_or_else(|| id.clone()),
        id,
        per_machine: flag(attrs, "PerMachine", false),
        vital: flag(attrs, "Vital", true),
        uninstallable: flag(attrs, "Uninstallable", true),
        install_condition: attrs.get("InstallCondition").cloned(),
        rollback_install_condition: attrs.get("RollbackInstallCondition").cloned(),
        size: number(attrs, "Size", 0),
        install_size: number(attrs, "InstallSize", 0),
        log_path_variable: attrs.get("LogPathVariable").cloned(),
        kind,
        ..Package::default()
    };

    state.packages.push(PendingPackage {
        package,
        payload_refs: Vec::new(),
        boundary_forward: attrs.get("RollbackBoundaryForward").cloned(),
        boundary_backward: attrs.get("RollbackBoundaryBackward").cloned(),
    });
    Ok(())
}

fn finish_related(state: &mut ParseState) -> EmberResult<()> {
    let related = state.current_related.take().ok_or_else(|| {
        EmberError::Manifest("unbalanced RelatedPackage element".to_string())
    })?;
    match &mut current_package(state, "RelatedPackage")?.package.kind {
        PackageKind::Msi(msi) => msi.related.push(related),
        _ => {
            return Err(EmberError::Manifest(
                "RelatedPackage only applies to MsiPackage".to_string(),
            ))
        }
    }
    Ok(())
}

fn current_package<'a>(
    state: &'a mut ParseState,
    element: &str,
) -> EmberResult<&'a mut PendingPackage> {
    state.packages.last_mut().ok_or_else(|| {
        EmberError::Manifest(format!("{element} outside a package element"))
    })
}

fn collect_attrs(e: &BytesStart<'_>) -> EmberResult<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| EmberError::Manifest(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| EmberError::Manifest(format!("bad attribute value: {e}")))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

fn required(
    attrs: &HashMap<String, String>,
    key: &str,
    element: &str,
) -> EmberResult<String> {
    attrs.get(key).cloned().ok_or_else(|| {
        EmberError::Manifest(format!("{element} is missing required attribute {key}"))
    })
}

fn flag(attrs: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match attrs.get(key).map(String::as_str) {
        Some("yes") | Some("true") | Some("1") => true,
        Some(_) => false,
        None => default,
    }
}

fn number(attrs: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    attrs
        .get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Resolution pass: every string reference becomes an index, and the
/// cross-reference rules are enforced.
fn resolve(state: ParseState) -> EmberResult<Manifest> {
    let ParseState {
        mut manifest,
        packages,
        payload_container,
        container_streams,
        current_related,
    } = state;

    if current_related.is_some() {
        return Err(EmberError::Manifest(
            "unterminated RelatedPackage element".to_string(),
        ));
    }

    let boundary_index: HashMap<&str, usize> = manifest
        .boundaries
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id.as_str(), i))
        .collect();
    let container_index: HashMap<&str, usize> = manifest
        .containers
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();
    let payload_index: HashMap<String, usize> = manifest
        .payloads
        .iter()
        .enumerate()
        .map(|(i, p)| (p.key.clone(), i))
        .collect();

    // payload -> owning container
    for (index, container_id) in payload_container.iter().enumerate() {
        if let Some(container_id) = container_id {
            let container = *container_index.get(container_id.as_str()).ok_or_else(|| {
                EmberError::Manifest(format!(
                    "payload '{}' references undeclared container '{container_id}'",
                    manifest.payloads[index].key
                ))
            })?;
            manifest.payloads[index].container = Some(container);
        }
    }

    // container stream layouts
    for (index, stream) in container_streams.into_iter().enumerate() {
        let mut resolved = Vec::with_capacity(stream.len());
        for key in stream {
            let payload = *payload_index.get(&key).ok_or_else(|| {
                EmberError::Manifest(format!(
                    "container '{}' references undeclared payload '{key}'",
                    manifest.containers[index].id
                ))
            })?;
            if manifest.payloads[payload].container != Some(index) {
                return Err(EmberError::Manifest(format!(
                    "payload '{key}' is streamed by container '{}' but not owned by it",
                    manifest.containers[index].id
                )));
            }
            resolved.push(payload);
        }
        manifest.containers[index].stream = resolved;
    }

    // packages: payload refs, boundary refs
    let package_ids: HashMap<String, usize> = packages
        .iter()
        .enumerate()
        .map(|(i, p)| (p.package.id.clone(), i))
        .collect();

    for pending in packages {
        let PendingPackage {
            mut package,
            payload_refs,
            boundary_forward,
            boundary_backward,
        } = pending;

        for key in payload_refs {
            let payload = *payload_index.get(&key).ok_or_else(|| {
                EmberError::Manifest(format!(
                    "package '{}' references undeclared payload '{key}'",
                    package.id
                ))
            })?;
            package.payloads.push(payload);
        }

        package.rollback_boundary_forward = boundary_forward
            .map(|id| {
                boundary_index.get(id.as_str()).copied().ok_or_else(|| {
                    EmberError::Manifest(format!(
                        "package '{}' references undeclared rollback boundary '{id}'",
                        package.id
                    ))
                })
            })
            .transpose()?;
        package.rollback_boundary_backward = boundary_backward
            .map(|id| {
                boundary_index.get(id.as_str()).copied().ok_or_else(|| {
                    EmberError::Manifest(format!(
                        "package '{}' references undeclared rollback boundary '{id}'",
                        package.id
                    ))
                })
            })
            .transpose()?;

        manifest.packages.push(package);
    }

    // slipstream references and the patch info arrays
    let mut patch_info = Vec::new();
    let mut patch_to_package = Vec::new();
    for index in 0..manifest.packages.len() {
        if let PackageKind::Msp(msp) = &manifest.packages[index].kind {
            patch_info.push(PatchSequenceInfo {
                patch_code: msp.patch_code.clone(),
                applicability_xml: msp.applicability_xml.clone(),
            });
            patch_to_package.push(index);
        }
    }
    for index in 0..manifest.packages.len() {
        let ids = match &manifest.packages[index].kind {
            PackageKind::Msi(msi) => msi.slipstream_patch_ids.clone(),
            _ => continue,
        };
        let mut resolved = Vec::with_capacity(ids.len());
        for id in &ids {
            let patch = *package_ids.get(id).ok_or_else(|| {
                EmberError::Manifest(format!(
                    "package '{}' slipstreams undeclared package '{id}'",
                    manifest.packages[index].id
                ))
            })?;
            if !matches!(manifest.packages[patch].kind, PackageKind::Msp(_)) {
                return Err(EmberError::Manifest(format!(
                    "package '{}' slipstreams '{id}' which is not an Msp package",
                    manifest.packages[index].id
                )));
            }
            resolved.push(patch);
        }
        if let PackageKind::Msi(msi) = &mut manifest.packages[index].kind {
            msi.slipstream_patches = resolved;
        }
    }

    manifest.patch_info = patch_info;
    manifest.patch_to_package = patch_to_package;
    debug_assert_eq!(manifest.patch_info.len(), manifest.patch_to_package.len());

    debug!(
        packages = manifest.packages.len(),
        payloads = manifest.payloads.len(),
        containers = manifest.containers.len(),
        "manifest parsed"
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::parse_manifest;
    use crate::manifest::{ExitCodeBehavior, PackageKind};

    const SAMPLE: &str = r#"
<BundleManifest Id="bundle.test" Name="Test Bundle" Version="1.0.0.0" PerMachine="no" ProviderKey="test.provider">
  <Variable Id="InstallLevel" Value="3" Type="numeric" Persisted="yes"/>
  <Variable Id="LicenseKey" Hidden="yes"/>
  <RollbackBoundary Id="B1" Vital="no"/>
  <Container Id="C1" FilePath="payloads.bin" Size="2048">
    <PayloadRef Id="L2"/>
  </Container>
  <Payload Id="L1" FilePath="first.msi" Size="1024" Hash="aa" SourcePath="first.msi"/>
  <Payload Id="L2" FilePath="second.exe" Size="2048" Container="C1" SourcePath="second.exe"/>
  <MsiPackage Id="P1" ProductCode="{11111111-2222-3333-4444-555555555555}" Version="1.0.0.0"
              Language="1033" RollbackBoundaryForward="B1" RollbackBoundaryBackward="B1">
    <PayloadRef Id="L1"/>
    <MsiProperty Id="INSTALLLEVEL" Value="[InstallLevel]"/>
    <SlipstreamMsp Id="P3"/>
  </MsiPackage>
  <ExePackage Id="P2" Vital="no" InstallArguments="/install" UninstallArguments="/uninstall">
    <PayloadRef Id="L2"/>
    <ExitCode Code="0" Behavior="success"/>
    <ExitCode Code="3010" Behavior="scheduleReboot"/>
    <ExitCode Code="*" Behavior="error"/>
  </ExePackage>
  <MspPackage Id="P3" PatchCode="{66666666-7777-8888-9999-000000000000}">
    <TargetProduct ProductCode="{11111111-2222-3333-4444-555555555555}" Order="1" Slipstream="yes"/>
  </MspPackage>
</BundleManifest>
"#;

    #[test]
    fn test_parse_sample_manifest() {
        let manifest = parse_manifest(SAMPLE).unwrap();

        assert_eq!(manifest.bundle.id, "bundle.test");
        assert!(!manifest.bundle.per_machine);
        assert_eq!(manifest.variables.len(), 2);
        assert!(manifest.variables[1].hidden);
        assert_eq!(manifest.boundaries.len(), 1);
        assert!(!manifest.boundaries[0].vital);
        assert_eq!(manifest.packages.len(), 3);
        assert_eq!(manifest.payloads.len(), 2);
    }

    #[test]
    fn test_cross_references_resolved_to_indices() {
        let manifest = parse_manifest(SAMPLE).unwrap();

        // payload ownership
        assert_eq!(manifest.payloads[0].container, None);
        assert_eq!(manifest.payloads[1].container, Some(0));
        assert_eq!(manifest.containers[0].stream, vec![1]);

        // boundaries
        let p1 = &manifest.packages[0];
        assert_eq!(p1.rollback_boundary_forward, Some(0));
        assert_eq!(p1.rollback_boundary_backward, Some(0));

        // slipstream
        let PackageKind::Msi(msi) = &p1.kind else {
            panic!("P1 should be an Msi package");
        };
        assert_eq!(msi.slipstream_patches, vec![2]);
        assert_eq!(msi.slipstream_patch_ids, vec!["P3".to_string()]);
    }

    #[test]
    fn test_patch_info_arrays_parallel() {
        let manifest = parse_manifest(SAMPLE).unwrap();
        assert_eq!(manifest.patch_info.len(), manifest.patch_to_package.len());
        assert_eq!(manifest.patch_to_package, vec![2]);
        assert_eq!(
            manifest.patch_info[0].patch_code,
            "{66666666-7777-8888-9999-000000000000}"
        );
    }

    #[test]
    fn test_exit_code_mappings() {
        let manifest = parse_manifest(SAMPLE).unwrap();
        let PackageKind::Exe(exe) = &manifest.packages[1].kind else {
            panic!("P2 should be an Exe package");
        };
        assert_eq!(exe.exit_codes.len(), 3);
        assert_eq!(exe.exit_codes[0].code, Some(0));
        assert_eq!(exe.exit_codes[1].behavior, ExitCodeBehavior::ScheduleReboot);
        assert_eq!(exe.exit_codes[2].code, None); // wildcard
    }

    #[test]
    fn test_undeclared_boundary_rejected() {
        let xml = r#"
<BundleManifest Id="b">
  <ExePackage Id="P1" RollbackBoundaryForward="Missing"/>
</BundleManifest>"#;
        assert!(parse_manifest(xml).is_err());
    }

    #[test]
    fn test_undeclared_payload_rejected() {
        let xml = r#"
<BundleManifest Id="b">
  <ExePackage Id="P1">
    <PayloadRef Id="Missing"/>
  </ExePackage>
</BundleManifest>"#;
        assert!(parse_manifest(xml).is_err());
    }

    #[test]
    fn test_slipstream_must_name_msp() {
        let xml = r#"
<BundleManifest Id="b">
  <MsiPackage Id="P1" ProductCode="{x}">
    <SlipstreamMsp Id="P2"/>
  </MsiPackage>
  <ExePackage Id="P2"/>
</BundleManifest>"#;
        assert!(parse_manifest(xml).is_err());
    }

    #[test]
    fn test_streamed_payload_must_be_owned() {
        let xml = r#"
<BundleManifest Id="b">
  <Container Id="C1" FilePath="c.bin">
    <PayloadRef Id="L1"/>
  </Container>
  <Payload Id="L1" FilePath="f" SourcePath="f"/>
</BundleManifest>"#;
        assert!(parse_manifest(xml).is_err());
    }

    #[test]
    fn test_missing_required_attribute() {
        let xml = r#"<BundleManifest Id="b"><Payload Id="L1"/></BundleManifest>"#;
        assert!(parse_manifest(xml).is_err());
    }
}
