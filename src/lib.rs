//! Device Registry CA - certificate issuance for IoT device registration
//!
//! Issues RSA client certificates for devices, signed by a CA whose
//! certificate and key are loaded once from PEM files, and registers the new
//! devices with a device registry.
//!
//! # Overview
//!
//! ```text
//! Device CA (self-signed, loaded from disk)
//!   └── Device certificate (CN = device name, clientAuth, CA=false)
//! ```
//!
//! Every issuance generates a fresh 2048-bit RSA key, wraps it in a signed
//! CSR, validates that CSR, and signs a certificate with the CA. The caller
//! receives the certificate and PKCS#1 key as PEM text.
//!
//! # Quick Start
//!
//! ```bash
//! # Create a CA (writes ca.pem and ca-key.pem)
//! device-registry-ca init-ca --common-name "Fleet Device CA"
//!
//! # Issue one certificate locally
//! device-registry-ca issue sensor-01 --out-dir out/
//!
//! # Run the registration service
//! REGISTRATION_SERVICE_AUTH_TOKEN=secret device-registry-ca serve
//! ```
//!
//! # Issuing From Code
//!
//! ```no_run
//! use device_registry_ca::ca_store::CaStore;
//! use device_registry_ca::generate_csr::SubjectTemplate;
//! use device_registry_ca::generate_device_cert::DeviceCertificateIssuer;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(CaStore::new("ca.pem", "ca-key.pem"));
//! let subject = SubjectTemplate {
//!     country: "US".to_string(),
//!     province: "California".to_string(),
//!     locality: "Irvine".to_string(),
//!     organization: "Example Corp".to_string(),
//!     organizational_unit: "Devices".to_string(),
//! };
//! let issuer = DeviceCertificateIssuer::new(store, subject, Duration::from_secs(60 * 60 * 24 * 60));
//!
//! let credentials = issuer.issue("sensor-01")?;
//! println!("{}", credentials.certificate_pem());
//! # Ok(())
//! # }
//! ```
//!
//! # Module Overview
//!
//! - [`ca_store`]: Loads the CA certificate and key once, retrying after failures
//! - [`generate_keypair`]: Fresh RSA device key pairs
//! - [`generate_csr`]: Builds and validates the device CSR
//! - [`ski`]: Subject key identifier calculation
//! - [`generate_device_cert`]: Signs device certificates with the CA
//! - [`generate_root_ca`]: Bootstraps a self-signed device CA
//! - [`registry`]: Device registry client
//! - [`webserver`]: HTTP registration endpoint
//! - [`configs`]: TOML and environment configuration
//!
//! # Error Handling
//!
//! Library operations return typed errors from [`error`]; the binary and the
//! configuration loader use `anyhow::Result`.

pub mod ca_store;
pub mod configs;
pub mod error;
pub mod generate_csr;
pub mod generate_device_cert;
pub mod generate_keypair;
pub mod generate_root_ca;
pub mod pem_block;
pub mod protocol;
pub mod registry;
pub mod ski;
pub mod webserver;
