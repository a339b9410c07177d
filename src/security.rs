use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Bom {
    bom_format: &'static str,
    spec_version: &'static str,
    version: u32,
    metadata: BomMetadata,
    components: Vec<Component>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BomMetadata {
    timestamp: String,
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    component: Option<Component>,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct Component {
    #[serde(rename = "type")]
    component_type: &'static str,
    name: String,
    version: Option<String>,
    purl: Option<String>,
    licenses: Option<Vec<LicenseWrapper>>,
}

#[derive(Debug, Serialize)]
struct LicenseWrapper {
    license: License,
}

#[derive(Debug, Serialize)]
struct License {
    id: String,
}

/// Generate a CycloneDX-style SBOM for the application whose `Cargo.toml`
/// is at `manifest_path` and write it to `output`.
pub fn generate_sbom(manifest_path: &Path, output: &Path) -> Result<()> {
    let metadata = MetadataCommand::new()
        .manifest_path(manifest_path)
        .exec()
        .with_context(|| format!("Failed to fetch cargo metadata for {}", manifest_path.display()))?;

    write_sbom(&metadata, output)
}

fn write_sbom(metadata: &Metadata, output: &Path) -> Result<()> {
    let timestamp = chrono::Utc::now().to_rfc3339();
    let root_id = metadata.root_package().map(|pkg| pkg.id.clone());
    let mut application = None;
    let mut components = Vec::new();

    for package in &metadata.packages {
        let is_root = root_id.as_ref() == Some(&package.id);

        // Path dependencies would leak local directory layout.
        if package.source.is_none() && !is_root {
            continue;
        }

        let component = Component {
            component_type: if is_root { "application" } else { "library" },
            name: package.name.clone(),
            version: Some(package.version.to_string()),
            purl: Some(format!(
                "pkg:cargo/{name}@{version}",
                name = package.name,
                version = package.version
            )),
            licenses: package.license.as_ref().map(|expr| {
                vec![LicenseWrapper {
                    license: License { id: expr.clone() },
                }]
            }),
        };

        if is_root {
            application = Some(component);
        } else {
            components.push(component);
        }
    }

    components.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));

    let bom = Bom {
        bom_format: "CycloneDX",
        spec_version: "1.5",
        version: 1,
        metadata: BomMetadata {
            timestamp,
            tools: vec![Tool {
                name: "imagesmith",
                version: env!("CARGO_PKG_VERSION"),
            }],
            component: application,
        },
        components,
    };

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create SBOM directory: {}", parent.display()))?;
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create SBOM file: {}", output.display()))?;
    serde_json::to_writer_pretty(file, &bom)
        .with_context(|| format!("Failed to write SBOM JSON: {}", output.display()))?;

    Ok(())
}

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Write the SHA256 digest of `path` into the `output` file.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display()).with_context(|| {
        format!(
            "Failed to write digest for '{}' into '{}'.",
            path.display(),
            output.display()
        )
    })?;
    Ok(digest)
}
