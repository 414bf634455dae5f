//! Common test harness utilities for integration tests.
//!
//! Provides ephemeral TLS materials (self-signed CA, localhost server
//! leaf, client leaf) and client-side rustls configuration builders.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::fs;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// TLS material paths returned by [`write_tls_materials`].
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub chain: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
    pub client_chain: PathBuf,
    pub client_key: PathBuf,
}

/// Generate a self-signed CA, a localhost server leaf, and a client leaf,
/// writing all materials into `dir`.
pub fn write_tls_materials(dir: &Path) -> TlsPaths {
    let ca_key = KeyPair::generate().expect("generate CA key");
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "test-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");
    let ca_pem = ca_cert.pem();

    let leaf_key = KeyPair::generate().expect("generate leaf key");
    let mut leaf_params =
        CertificateParams::new(vec!["localhost".into()]).expect("leaf cert params");
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("sign leaf cert");

    let client_key = KeyPair::generate().expect("generate client key");
    let mut client_params =
        CertificateParams::new(vec!["test-client".into()]).expect("client cert params");
    client_params
        .distinguished_name
        .push(DnType::CommonName, "test-client");
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .expect("sign client cert");

    let mut chain = leaf_cert.pem();
    chain.push_str(&ca_pem);
    let mut client_chain = client_cert.pem();
    client_chain.push_str(&ca_pem);

    let ca_path = dir.join("ca.pem");
    let chain_path = dir.join("chain.pem");
    let key_path = dir.join("key.pem");
    let client_chain_path = dir.join("client.pem");
    let client_key_path = dir.join("client-key.pem");
    fs::write(&ca_path, &ca_pem).expect("write CA");
    fs::write(&chain_path, &chain).expect("write chain");
    fs::write(&key_path, leaf_key.serialize_pem()).expect("write key");
    fs::write(&client_chain_path, &client_chain).expect("write client chain");
    fs::write(&client_key_path, client_key.serialize_pem()).expect("write client key");

    TlsPaths {
        chain: chain_path,
        key: key_path,
        ca: ca_path,
        client_chain: client_chain_path,
        client_key: client_key_path,
    }
}

/// Client-side rustls configuration trusting the test CA, optionally
/// presenting the client certificate.
pub fn client_tls_config(paths: &TlsPaths, with_client_cert: bool) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&paths.ca).expect("open test CA"),
    ))
    .collect::<std::io::Result<_>>()
    .expect("read test CA");
    for cert in certs {
        roots.add(cert).expect("add test CA");
    }
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = if with_client_cert {
        let chain: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(
            File::open(&paths.client_chain).expect("open client chain"),
        ))
        .collect::<std::io::Result<_>>()
        .expect("read client chain");
        let key = rustls_pemfile::private_key(&mut BufReader::new(
            File::open(&paths.client_key).expect("open client key"),
        ))
        .expect("read client key")
        .expect("client key present");
        builder
            .with_client_auth_cert(chain, key)
            .expect("client auth config")
    } else {
        builder.with_no_client_auth()
    };
    Arc::new(config)
}

/// A plain-TCP listener config bound to an ephemeral loopback port.
pub fn tcp_listener_config() -> strato::config::ListenerConfig {
    strato::config::ListenerConfig {
        bind: "127.0.0.1:0".to_string(),
        backlog: 16,
        websocket: false,
        tls: None,
    }
}
