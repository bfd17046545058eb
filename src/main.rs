/// Pre-boot authentication init for self-encrypting drives.
///
/// Built static for the initramfs:
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// cargo build --release --target=x86_64-unknown-linux-musl
/// ```
/// Install the binary as `/init` of the PBA image written to the drives'
/// shadow MBR area.
use eyre::Result;
use sed_pba::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    cli.run()?;
    Ok(())
}
