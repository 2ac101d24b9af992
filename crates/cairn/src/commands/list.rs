//! List generations

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::Args;

use cairn::list_generations;

/// List the generations in a backup root, oldest first
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Backup root
    root: PathBuf,
}

pub fn run(args: ListArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    write_list(&args.root, io::stdout().lock())
}

/// One generation name per line.
fn write_list(
    root: &Path,
    mut out: impl Write,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for name in list_generations(root)? {
        writeln!(out, "{name}")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lists_generations_oldest_first() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("2024-06-01-00:00:00.000")).unwrap();
        fs::create_dir(root.path().join("2024-01-01-12:30:00.500")).unwrap();
        fs::create_dir(root.path().join("not-a-generation")).unwrap();
        fs::write(root.path().join(".backup_log"), b"").unwrap();

        let mut out = Vec::new();
        write_list(root.path(), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "2024-01-01-12:30:00.500\n2024-06-01-00:00:00.000\n"
        );
    }

    #[test]
    fn test_empty_root_lists_nothing() {
        let root = TempDir::new().unwrap();
        let mut out = Vec::new();
        write_list(root.path(), &mut out).unwrap();
        assert!(out.is_empty());
    }
}
