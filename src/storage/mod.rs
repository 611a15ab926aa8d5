pub mod certificates;

pub use certificates::{
    CertificateBundle, CertificateStore, CertificateSummary, FileCertificateStore,
};
