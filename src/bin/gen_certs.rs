//! Certificate Generation Tool

use anyhow::{bail, Result};
use clap::Parser;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use std::net::IpAddr;
use std::path::PathBuf;

const KEY_SIZES: [usize; 3] = [2048, 3072, 4096];

/// Generate a self-signed TLS certificate for SMTP Mux
#[derive(Parser, Debug)]
#[command(name = "smtp-mux-gen-certs")]
#[command(about = "Generate a self-signed TLS certificate and key")]
#[command(version)]
struct Args {
    /// Host names and IP addresses, comma separated
    #[arg(long, default_value = "mail.example.com", value_delimiter = ',')]
    host: Vec<String>,

    /// Certificate output path
    #[arg(long, default_value = "server.crt")]
    cert: PathBuf,

    /// Private key output path
    #[arg(long, default_value = "server.key")]
    key: PathBuf,

    /// Validity in days
    #[arg(short, long, default_value_t = 365)]
    days: i64,

    /// RSA key size in bits (2048, 3072 or 4096)
    #[arg(long, default_value_t = 2048)]
    key_size: usize,
}

fn subject_alt_name(host: &str) -> SanType {
    match host.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(host.to_string()),
    }
}

/// Self-signed certificate and PKCS#8 private key, both PEM encoded
fn generate(hosts: &[&str], key_size: usize, days: i64) -> Result<(String, String)> {
    let Some(primary) = hosts.first() else {
        bail!("no host given");
    };

    let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), key_size)?;
    let key_pem = rsa_key.to_pkcs8_pem(LineEnding::LF)?;
    let key_pair = KeyPair::from_pem(&key_pem)?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::OrganizationName, "Mail Services");
    params.distinguished_name.push(DnType::CommonName, *primary);
    params.subject_alt_names = hosts.iter().map(|h| subject_alt_name(h)).collect();

    // Set validity
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(days);

    // Key usage
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    params.alg = &rcgen::PKCS_RSA_SHA256;
    params.key_pair = Some(key_pair);
    let cert = Certificate::from_params(params)?;

    Ok((cert.serialize_pem()?, cert.serialize_private_key_pem()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let hosts: Vec<&str> = args
        .host
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .collect();
    if hosts.is_empty() {
        bail!("at least one --host is required");
    }
    if args.days <= 0 {
        bail!("--days must be positive");
    }
    if !KEY_SIZES.contains(&args.key_size) {
        bail!("--key-size must be one of 2048, 3072 or 4096");
    }

    println!("Generating TLS certificate for: {}", hosts.join(", "));
    println!("Generating {}-bit RSA key (this may take a moment)...", args.key_size);
    let (cert_pem, key_pem) = generate(&hosts, args.key_size, args.days)?;

    if let Some(dir) = args.cert.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(dir) = args.key.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&args.cert, cert_pem)?;
    std::fs::write(&args.key, key_pem)?;

    println!();
    println!("Generated:");
    println!("  Certificate: {}", args.cert.display());
    println!("  Private key: {}", args.key.display());
    println!("  Key:         RSA {} bits", args.key_size);
    println!("  Valid for:   {} days", args.days);
    println!();
    println!("Copy the certificate to clients as their ca_cert.");
    println!("Keep the private key on the server.");

    Ok(())
}
