const PROTOS: &[&str] = &[
    "proto/activation.proto",
    "proto/kms.proto",
    "proto/recover.proto",
    "proto/nodestatus.proto",
    "proto/upgrade.proto",
    "proto/etcd.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(PROTOS, &["proto"])?;

    for proto in PROTOS {
        println!("cargo:rerun-if-changed={proto}");
    }

    Ok(())
}
