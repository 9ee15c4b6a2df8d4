/* This is part of smartblock-agent - which is under the MIT License **********/

use snafu::{ResultExt, OptionExt};

use std::path::{Path, PathBuf};
use crate::error::Result;
use crate::error;
use log::*;

/// Retrieve the last path component of an URL, as a PathBuf
pub fn url_last(url: &url::Url) -> Result<PathBuf> {
    let filename = url.path_segments()
        .context(error::URLExtractError{url: url.clone()})?
        .last()
        .filter(|segment| ! segment.is_empty())
        .context(error::URLExtractError{url: url.clone()})?;
    Ok(PathBuf::from(filename))
}

/// Copy `from` to `to` so that `to` either does not exist or holds the
/// complete file. The data first lands next to the destination and is then
/// renamed over it. On unix platforms the result is made executable.
pub fn install_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(dir) = to.parent() {
        std::fs::create_dir_all(dir).context(
            error::CreateDirError{ path: dir.to_path_buf() })?;
    }
    let mut partial = to.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    debug!("Copying {:#?} to {:#?}", from, partial);
    let copied = std::fs::copy(from, &partial)
        .context(error::CopyFailed{ from: from.to_path_buf(), to: partial.clone() })
        .and_then(|_| make_executable(&partial))
        .and_then(|_| {
            std::fs::rename(&partial, to).context(error::CopyFailed{
                from: partial.clone(),
                to: to.to_path_buf(),
            })
        });
    if copied.is_err() {
        if let Err(err) = std::fs::remove_file(&partial) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {:#?}: {}", partial, err);
            }
        }
    }
    copied
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .context(error::FailedToWrite{ path: path.to_path_buf() })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_url_component_is_the_file_name() {
        let url = url::Url::parse(
            "https://downloads.arduino.cc/arduino-cli/arduino-cli_latest_Linux_64bit.tar.gz")
            .unwrap();
        assert_eq!(url_last(&url).unwrap(), PathBuf::from("arduino-cli_latest_Linux_64bit.tar.gz"));

        let url = url::Url::parse("https://downloads.arduino.cc/arduino-cli/").unwrap();
        assert!(url_last(&url).is_err());
    }

    #[test]
    fn installed_file_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("source");
        let to = dir.path().join("bin").join("arduino-cli");
        std::fs::write(&from, b"new").unwrap();

        install_file(&from, &to).unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert!(! dir.path().join("bin").join("arduino-cli.partial").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&to).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn failed_copy_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("arduino-cli");
        assert!(install_file(&dir.path().join("missing"), &to).is_err());
        assert!(! to.exists());
        assert!(! dir.path().join("arduino-cli.partial").exists());
    }
}
