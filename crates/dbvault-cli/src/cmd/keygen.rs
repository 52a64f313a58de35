use dbvault_core::pipeline::keyring::generate_key_hex;

/// Print a fresh key as a config snippet. Nothing is written to disk.
pub(crate) fn run_keygen(id: &str) {
    let key = generate_key_hex();
    println!("# Add under encryption.keys and keep a copy outside this host.");
    println!("- id: {id}");
    println!("  key_hex: \"{}\"", key.as_str());
}
