//! Reading PEM-encoded server identities into the [`Certificate`]s and
//! [`PrivateKey`]s rustls wants.

use std::{fs::File, io, io::Read, path::Path};
use tokio_rustls::rustls::{Certificate, PrivateKey};

const KEY_TAGS: &[&str] = &["PRIVATE KEY", "RSA PRIVATE KEY", "EC PRIVATE KEY"];

/// Load a certificate chain and its private key from a pair of PEM files.
pub fn read_identity(
    certificate_path: impl AsRef<Path>,
    private_key_path: impl AsRef<Path>,
) -> Result<(Vec<Certificate>, PrivateKey), io::Error> {
    let certificates = read_certificates(&certificate_path)?;
    if certificates.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "no CERTIFICATE entries in {}",
                certificate_path.as_ref().display()
            ),
        ));
    }
    Ok((certificates, read_private_key(private_key_path)?))
}

/// Read every PEM entry labeled `CERTIFICATE` from the file at `path`,
/// silently skipping entries with other labels.
pub fn read_certificates(path: impl AsRef<Path>) -> Result<Vec<Certificate>, io::Error> {
    Ok(pem::parse_many(read_file(path)?)
        .into_iter()
        .filter(|entry| entry.tag == "CERTIFICATE")
        .map(|entry| Certificate(entry.contents))
        .collect())
}

/// Read the file at `path` as a single PEM-encoded private key. Accepts the
/// PKCS#8 label as well as the legacy RSA and EC ones.
pub fn read_private_key(path: impl AsRef<Path>) -> Result<PrivateKey, io::Error> {
    let entry = pem::parse(read_file(&path)?).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid PEM encoding in private key: {}", e),
        )
    })?;
    if KEY_TAGS.contains(&entry.tag.as_str()) {
        Ok(PrivateKey(entry.contents))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("not labeled as a private key: '{}'", entry.tag),
        ))
    }
}

fn read_file(path: impl AsRef<Path>) -> Result<Vec<u8>, io::Error> {
    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    Ok(contents)
}
