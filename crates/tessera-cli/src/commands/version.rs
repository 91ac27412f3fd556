//! Version command.

pub fn run() {
    println!("tessera {}", env!("CARGO_PKG_VERSION"));
}
