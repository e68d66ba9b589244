use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};

use mockzfs::layout::{plan, Disk, LayoutKind};

#[derive(Parser)]
#[command(version, about = "Plan a ZFS pool layout from a disk inventory")]
struct Cli {
    /// JSON disk inventory file; standard input when omitted.
    #[arg(value_hint = clap::ValueHint::FilePath)]
    inventory: Option<PathBuf>,

    /// Apply this layout instead of choosing one from the disk count.
    #[arg(short = 'l', long = "layout")]
    layout: Option<LayoutKind>,
}

fn read_inventory(path: Option<&PathBuf>) -> Result<Vec<Disk>> {
    let data = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read standard input")?;
            buf
        }
    };
    serde_json::from_str(&data).context("Failed to parse the disk inventory")
}

fn main() -> Result<()> {
    // Level comes from RUST_LOG, defaulting to info.
    Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let disks = read_inventory(cli.inventory.as_ref())?;
    let layout = plan(&disks, cli.layout).context("Failed to compute a pool layout")?;
    println!("{}", serde_json::to_string_pretty(&layout)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_read_inventory_parses_json() {
        let dir = std::env::temp_dir().join("disklayout-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("inventory.json");
        fs::write(
            &path,
            r#"[{"name":"c0t0d0","size":80000,"type":"scsi","removable":false,"solid_state":false}]"#,
        )
        .unwrap();
        let disks = read_inventory(Some(&path)).unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].name, "c0t0d0");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_inventory_rejects_garbage() {
        let dir = std::env::temp_dir().join("disklayout-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("garbage.json");
        fs::write(&path, "not json").unwrap();
        assert!(read_inventory(Some(&path)).is_err());
        fs::remove_file(&path).unwrap();
    }
}
