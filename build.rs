use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Messages posted to the management server as JSON. prost only derives the binary
/// codec, so these get serde derives with protobuf-JSON field naming. `Telemetry` itself is
/// projected by `mgmtapi`, since its oneof needs flattening.
const JSON_MESSAGES: &[&str] = &[
    ".meshtastic.DeviceMetrics",
    ".meshtastic.EnvironmentMetrics",
    ".meshtastic.Waypoint",
];

/// proto3 `optional` scalars inside JSON_MESSAGES; unset values are omitted like protojson does.
const OPTIONAL_JSON_FIELDS: &[&str] = &[
    ".meshtastic.DeviceMetrics.battery_level",
    ".meshtastic.DeviceMetrics.voltage",
    ".meshtastic.DeviceMetrics.channel_utilization",
    ".meshtastic.DeviceMetrics.air_util_tx",
    ".meshtastic.DeviceMetrics.uptime_seconds",
    ".meshtastic.EnvironmentMetrics.temperature",
    ".meshtastic.EnvironmentMetrics.relative_humidity",
    ".meshtastic.EnvironmentMetrics.barometric_pressure",
    ".meshtastic.Waypoint.latitude_i",
    ".meshtastic.Waypoint.longitude_i",
];

/// Plain proto3 scalars inside JSON_MESSAGES; protojson omits them at their zero value.
const PLAIN_JSON_FIELDS: &[&str] = &[
    ".meshtastic.Waypoint.id",
    ".meshtastic.Waypoint.expire",
    ".meshtastic.Waypoint.locked_to",
    ".meshtastic.Waypoint.name",
    ".meshtastic.Waypoint.description",
    ".meshtastic.Waypoint.icon",
];

fn main() {
    // Ensure a working `protoc` is available across all CI runners by using a vendored binary.
    // This avoids relying on system packages on macOS/Windows/Linux (including cross builds).
    if let Ok(path) = protoc_bin_vendored::protoc_bin_path() {
        std::env::set_var("PROTOC", &path);
        eprintln!("build.rs: Using vendored protoc at {}", path.display());
    }

    println!("cargo:rerun-if-env-changed=MESHTASTIC_PROTO_DIR");
    println!("cargo:rerun-if-changed=protos");

    let proto_dir = env::var("MESHTASTIC_PROTO_DIR").unwrap_or_else(|_| "protos".into());
    let proto_root = PathBuf::from(&proto_dir);

    fn collect_protos(dir: &Path, acc: &mut Vec<PathBuf>) {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    collect_protos(&path, acc);
                } else if path.extension().and_then(|e| e.to_str()) == Some("proto") {
                    acc.push(path);
                }
            }
        }
    }

    let mut protos = Vec::new();
    collect_protos(&proto_root, &mut protos);
    if protos.is_empty() {
        panic!(
            "No Meshtastic .proto files found under '{}'. Set MESHTASTIC_PROTO_DIR to a directory containing meshtastic/*.proto",
            proto_root.display()
        );
    }

    // Imports are written as `meshtastic/<file>.proto`, so the include path is the
    // directory that contains `meshtastic/`. Passing the meshtastic dir itself as well
    // would make protoc see each file twice and report duplicate definitions.
    let include_root = if proto_root.file_name().and_then(|n| n.to_str()) == Some("meshtastic") {
        proto_root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| proto_root.clone())
    } else {
        proto_root.clone()
    };
    eprintln!("build.rs: Using include path: {}", include_root.display());

    let mut config = prost_build::Config::new();
    config.bytes(["."]);

    for message in JSON_MESSAGES {
        config.type_attribute(
            message,
            "#[derive(serde::Serialize)] #[serde(rename_all = \"camelCase\")]",
        );
    }
    for field in OPTIONAL_JSON_FIELDS {
        config.field_attribute(field, "#[serde(skip_serializing_if = \"Option::is_none\")]");
    }
    for field in PLAIN_JSON_FIELDS {
        config.field_attribute(
            field,
            "#[serde(skip_serializing_if = \"crate::protobuf::is_default\")]",
        );
    }

    let mut unique = protos.clone();
    unique.sort();
    unique.dedup();

    eprintln!("build.rs: Compiling {} proto files", unique.len());
    for p in &unique {
        eprintln!("  proto: {}", p.display());
    }

    config
        .compile_protos(&unique, &[include_root])
        .expect("Failed to compile protos");
}
