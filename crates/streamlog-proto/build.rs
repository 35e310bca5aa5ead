// Build script to compile protobuf files into Rust code.
//
// This runs at compile time and generates the message structs and the
// client/server traits for the Log service from proto/log.proto.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        // Generate `bytes::Bytes` for bytes fields so record values are
        // cheap to clone along the produce/replicate path.
        .bytes(["."])
        .compile_protos(&["proto/log.proto"], &["proto"])?;

    Ok(())
}
