use std::io::ErrorKind;
use std::path::Path;
use std::{fs, io};

const PROTO_DIR: &str = "./protos/";
const RAFT_PROTO: &str = "./protos/raft.proto";
// Written next to src/ so that `include!` in lib.rs has a stable path.
const GENERATED_DIR: &str = "./generated/";

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed={}", RAFT_PROTO);
    idempotent_create_dir(GENERATED_DIR)?;

    // Nodes are both servers and clients of the same service.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(GENERATED_DIR)
        .compile(&[RAFT_PROTO], &[PROTO_DIR])
}

fn idempotent_create_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::create_dir(path) {
        Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}
