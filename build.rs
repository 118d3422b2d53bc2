fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Ensure a protoc binary is available even when none is installed
    // system-wide, by pointing at the vendored copy.
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/flowmesh.proto"], &["proto"])?;
    Ok(())
}
