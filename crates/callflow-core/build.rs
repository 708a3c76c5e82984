/// Generates the gRPC client and server bindings for `proto/callflow.proto`
/// using `tonic-prost-build`.
///
/// Besides the message and service modules, the build also emits an encoded
/// `FileDescriptorSet` (`callflow_descriptor.bin`) into `OUT_DIR`. The server
/// registers it with the gRPC reflection service so tools such as `grpcurl`
/// can discover `callflow.Dispatcher` without a local copy of the schema.
///
/// # Files and Paths
///
/// - Proto file: `proto/callflow.proto`
/// - Includes: `proto/`
///
/// # Panics
///
/// Panics if code generation fails; a build script has no better channel for
/// reporting the failure.
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("callflow_descriptor.bin");

    println!("cargo:rerun-if-changed=proto/callflow.proto");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/callflow.proto"], &["proto"])
        .unwrap();
}
