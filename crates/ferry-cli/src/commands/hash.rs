//! Hash command implementation.

use anyhow::{Context, Result};

use ferry_core::checksum;
use ferry_core::file::format_size;

use super::HashArgs;

/// Run the hash command.
///
/// Prints both digests, or verifies them when expected values are given.
pub async fn run(args: HashArgs) -> Result<()> {
    if !args.file.is_file() {
        anyhow::bail!("File not found: {}", args.file.display());
    }

    if args.md5.is_some() || args.sha256.is_some() {
        let valid = checksum::validate_file_integrity(
            &args.file,
            args.md5.as_deref(),
            args.sha256.as_deref(),
        )
        .await
        .with_context(|| format!("Failed to hash {}", args.file.display()))?;

        if args.json {
            let output = serde_json::json!({
                "file": args.file,
                "valid": valid,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else if valid {
            println!("  OK  {}", args.file.display());
        } else {
            println!("  MISMATCH  {}", args.file.display());
        }

        if !valid {
            anyhow::bail!("Checksum mismatch for {}", args.file.display());
        }
        return Ok(());
    }

    let digests = checksum::file_digests(&args.file)
        .await
        .with_context(|| format!("Failed to hash {}", args.file.display()))?;

    if args.json {
        let output = serde_json::json!({
            "file": args.file,
            "size": digests.size,
            "md5": digests.md5,
            "sha256": digests.sha256,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("  {} ({})", args.file.display(), format_size(digests.size));
        println!("  MD5     {}", digests.md5);
        println!("  SHA256  {}", digests.sha256);
    }
    Ok(())
}
