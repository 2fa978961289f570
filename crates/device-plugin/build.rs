fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The client side is needed for registration with the kubelet and the startup self-dial.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/api.proto"], &["proto"])?;
    Ok(())
}
