// SPDX-License-Identifier: GPL-2.0

#[cfg(feature = "bpf")]
fn main() {
    use std::path::PathBuf;

    println!("cargo:rerun-if-env-changed=SCX_FLATCG_BPF_DIR");

    let dir = match std::env::var_os("SCX_FLATCG_BPF_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => panic!("SCX_FLATCG_BPF_DIR must point at the directory holding scx_flatcg.bpf.c"),
    };
    let intf = dir.join("scx_flatcg.h");
    let prog = dir.join("scx_flatcg.bpf.c");

    scx_cargo::BpfBuilder::new()
        .unwrap()
        .enable_intf(&intf.to_string_lossy(), "bpf_intf.rs")
        .enable_skel(&prog.to_string_lossy(), "bpf")
        .build()
        .unwrap();
}

#[cfg(not(feature = "bpf"))]
fn main() {}
