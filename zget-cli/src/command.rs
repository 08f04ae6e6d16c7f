use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zget_core::config::ZgetConfig;
use zget_core::{Ciphersuite, ZgetError, negotiate};
use zget_engine::{GetOutcome, GetRequest, ShareOutcome, ShareRequest};

use crate::CommonArgs;
use crate::ui::{format_size, progress_bar};

const ALIAS_LEN: usize = 8;

/// Handles `zget get [filename] [output]`.
pub async fn run_get(
    filename: Option<String>,
    output: Option<PathBuf>,
    common: &CommonArgs,
    config: &ZgetConfig,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let (filename, hint) = get_pairing(filename);
    if !quiet {
        println!("  {hint}");
    }

    let ciphersuite = ciphersuite(common, &filename).await?;
    let request = GetRequest {
        filename,
        output,
        timeout: common.timeout,
    };
    let progress = (!quiet).then(|| progress_bar("Downloading"));

    match zget_engine::get(
        &request,
        &ciphersuite,
        progress,
        config.poll_interval(),
        cancel,
    )
    .await
    {
        Ok(GetOutcome::Completed { path }) => {
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            println!("  ✅ Saved {} ({})", path.display(), format_size(size));
            Ok(())
        }
        Ok(GetOutcome::Cancelled) => {
            info!("Cancelled");
            Ok(())
        }
        Err(e) => Err(explain(e)),
    }
}

/// Handles `zget put <input> [alias]`.
pub async fn run_put(
    mut request: ShareRequest,
    common: &CommonArgs,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let (alias, hint) = put_pairing(&request.path, request.alias.take());
    if !quiet {
        println!("  {hint}");
    }
    request.alias = Some(alias);

    let label = display_name(&request.path);
    let ciphersuite = ciphersuite(common, &label).await?;
    let progress = (!quiet).then(|| progress_bar("Uploading"));

    match zget_engine::put(request, ciphersuite, progress, cancel).await {
        Ok(ShareOutcome::Downloaded) => {
            println!("  ✅ File was downloaded by a peer");
            Ok(())
        }
        Ok(ShareOutcome::Cancelled) => {
            info!("Cancelled");
            Ok(())
        }
        Err(e) => Err(explain(e)),
    }
}

/// Random lowercase name both sides can type.
pub fn generate_alias() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ALIAS_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Name to fetch plus the command the sender should run.
fn get_pairing(filename: Option<String>) -> (String, String) {
    match filename {
        Some(name) => {
            let hint = format!("Upload a file using `zget put {name}` or `zget put <filename> {name}`");
            (name, hint)
        }
        None => {
            let alias = generate_alias();
            let hint = format!("Upload a file using `zget put <filename> {alias}`");
            (alias, hint)
        }
    }
}

/// Alias to advertise plus the command the receiver should run.
fn put_pairing(input: &Path, alias: Option<String>) -> (String, String) {
    let alias = alias.unwrap_or_else(generate_alias);
    let hint = format!(
        "Download this file using `zget get {}` or `zget get {alias}`",
        display_name(input)
    );
    (alias, hint)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Negotiates the cipher suite, prompting for a password when neither
/// `--password` nor `--bypass-encryption` was given.
async fn ciphersuite(common: &CommonArgs, label: &str) -> Result<Ciphersuite> {
    let prompted;
    let password = match (&common.password, common.bypass_encryption) {
        (Some(password), _) => Some(password.as_str()),
        (None, true) => None,
        (None, false) => {
            prompted = prompt_password(label).await?;
            Some(prompted.as_str())
        }
    };
    negotiate(password, common.bypass_encryption)
        .map_err(ZgetError::from)
        .map_err(explain)
}

/// Reads the password from the terminal with echo turned off.
async fn prompt_password(label: &str) -> Result<String> {
    let prompt = format!("Password for '{label}': ");
    let password = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
        .await
        .context("password prompt was interrupted")?
        .context("failed to read the password")?;
    if password.is_empty() {
        bail!("the password must not be empty");
    }
    Ok(password)
}

/// Wraps an engine error with a hint for the failures users can act on.
fn explain(err: ZgetError) -> anyhow::Error {
    let hint = match &err {
        ZgetError::PeerNotFound { .. } => Some("is the sender running with the same file name?"),
        ZgetError::AuthenticationFailed(_) => {
            Some("do both sides use the same password and encryption setting?")
        }
        ZgetError::CapabilityUnavailable(_) => {
            Some("rebuild with the `pake` feature or pass --bypass-encryption")
        }
        _ => None,
    };
    if err.is_retryable() {
        warn!("This failure may be temporary; retrying can help");
    }
    match hint {
        Some(hint) => anyhow::Error::new(err).context(hint),
        None => anyhow::Error::new(err),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use zget_core::ServiceIdentity;

    use super::*;

    fn common(password: Option<&str>, bypass: bool) -> CommonArgs {
        CommonArgs {
            timeout: None,
            password: password.map(str::to_owned),
            bypass_encryption: bypass,
        }
    }

    #[tokio::test]
    async fn given_bypass_flag_when_negotiating_then_bypass_suite() {
        let suite = ciphersuite(&common(None, true), "a.txt").await.unwrap();
        assert!(suite.is_bypass());
    }

    #[tokio::test]
    async fn given_password_flag_when_negotiating_then_no_prompt_is_needed() {
        let suite = ciphersuite(&common(Some("pw"), false), "a.txt").await.unwrap();
        assert!(!suite.is_bypass());
    }

    #[test]
    fn when_generating_alias_expect_short_lowercase_name() {
        let alias = generate_alias();
        assert_eq!(alias.len(), ALIAS_LEN);
        assert!(alias.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn given_no_filename_when_pairing_get_then_alias_is_generated_and_hinted() {
        let (name, hint) = get_pairing(None);
        assert_eq!(name.len(), ALIAS_LEN);
        assert_eq!(hint, format!("Upload a file using `zget put <filename> {name}`"));
    }

    #[test]
    fn given_filename_when_pairing_get_then_it_is_kept() {
        let (name, hint) = get_pairing(Some("notes.md".into()));
        assert_eq!(name, "notes.md");
        assert!(hint.contains("`zget put notes.md`"));
    }

    #[test]
    fn given_no_alias_when_pairing_put_then_both_names_are_hinted() {
        let (alias, hint) = put_pairing(Path::new("/tmp/photos/cat.png"), None);
        assert_eq!(alias.len(), ALIAS_LEN);
        assert_eq!(
            hint,
            format!("Download this file using `zget get cat.png` or `zget get {alias}`")
        );
    }

    #[test]
    fn given_alias_when_pairing_put_then_it_is_kept() {
        let (alias, _) = put_pairing(Path::new("cat.png"), Some("kitty".into()));
        assert_eq!(alias, "kitty");
    }

    #[test]
    fn given_missing_password_when_explained_then_no_rebuild_hint() {
        let err = explain(ZgetError::from(zget_core::CipherError::MissingPassword));
        assert!(!err.to_string().contains("pake"));
        assert!(matches!(
            err.downcast_ref::<ZgetError>(),
            Some(ZgetError::InvalidRequest(_))
        ));
    }

    #[test]
    fn given_peer_not_found_when_explained_then_hint_is_outermost() {
        let err = explain(ZgetError::PeerNotFound {
            identity: ServiceIdentity::derive("a.txt"),
            timeout: Duration::from_secs(1),
        });
        assert!(err.to_string().contains("same file name"));
        assert!(err.downcast_ref::<ZgetError>().is_some());
    }

    #[test]
    fn given_other_error_when_explained_then_message_is_kept() {
        let err = explain(ZgetError::InvalidRequest("bad".into()));
        assert_eq!(err.to_string(), "invalid request: bad");
    }
}
