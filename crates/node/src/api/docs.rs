//! Plain-text descriptions served on GET/HEAD for each endpoint.

pub const HOSTNAME_FROM_CERT: &str = "\
POST a PEM-encoded certificate to this endpoint to recover the hostname it
covers. The response body is the base name with any leading \"*.\" removed.
";

pub const HOSTNAME_FROM_CSR: &str = "\
POST a certificate signing request (PEM or DER) to this endpoint. The CSR
must assert exactly one name: the wildcard of the hostname pinned to its
public key. On success the response body is that hostname, and the CSR is
remembered so the certificate can later be fetched by hostname alone.
";

pub const HOSTNAME_FROM_KEY: &str = "\
POST a PEM-encoded ECDSA P-256 private key to this endpoint. The response
body is the hostname pinned to the key's public half. A CSR is generated
and remembered as a side effect.
";

pub const CSR_FROM_KEY: &str = "\
POST a PEM-encoded ECDSA P-256 private key to this endpoint. The response
is a PEM certificate signing request for the wildcard of the key's pinned
hostname, signed with the key.
";

pub const KEY: &str = "\
POST to this endpoint to receive a freshly generated ECDSA P-256 private
key in PEM form. The key is generated server-side; prefer generating keys
locally and using /hostname-from-key when you can.
";

pub const CERT_FROM_CSR: &str = "\
POST a certificate signing request (PEM or DER, at most 10 KiB) whose only
name is the wildcard of its key's pinned hostname. The server satisfies
the CA's DNS challenge on your behalf and responds with the PEM
certificate chain. Expect this to take tens of seconds on a cache miss.
";

pub const CERT_FROM_KEY: &str = "\
POST a PEM-encoded ECDSA P-256 private key. The server derives the pinned
hostname, builds the CSR, obtains the certificate, and responds with the
PEM chain. Prefer /cert-from-csr so the key never leaves your machine.
";

pub const CERT_BY_HOSTNAME: &str = "\
GET /cert/<hostname> returns the PEM certificate chain for a hostname
whose CSR this service has already seen, renewing it first if needed.
";
