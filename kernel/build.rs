fn main() {
    // Relink when the sources or the layout change
    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=linker.ld");
}
