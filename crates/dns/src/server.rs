use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::Record;
use hickory_proto::serialize::binary::BinDecodable;
use pinhost_store::StateStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::dnssec::ZoneSigner;
use crate::error::{DnsError, Result};

const TCP_READ_TIMEOUT: Duration = Duration::from_secs(10);
const EDNS_PAYLOAD: u16 = 1232;

/// The authoritative DNS server: one UDP and one TCP listener on the same
/// address, each query handled in its own task.
pub struct DnsServer {
    cancel: CancellationToken,
    udp_task: JoinHandle<()>,
    tcp_task: JoinHandle<()>,
}

impl DnsServer {
    /// Bind both listeners and start serving.
    pub async fn start<S: StateStore>(
        listen_addr: SocketAddr,
        backend: Arc<Backend<S>>,
        signer: Arc<ZoneSigner>,
    ) -> Result<DnsServer> {
        let udp = UdpSocket::bind(listen_addr)
            .await
            .map_err(|e| DnsError::Bind { address: listen_addr.to_string(), source: e })?;
        let tcp = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| DnsError::Bind { address: listen_addr.to_string(), source: e })?;

        let cancel = CancellationToken::new();

        let udp_task = tokio::spawn(serve_udp(
            Arc::new(udp),
            Arc::clone(&backend),
            Arc::clone(&signer),
            cancel.clone(),
        ));
        let tcp_task = tokio::spawn(serve_tcp(tcp, backend, signer, cancel.clone()));

        tracing::info!(addr = %listen_addr, "dns server listening (udp+tcp)");
        Ok(DnsServer { cancel, udp_task, tcp_task })
    }

    /// Stop both listeners and wait for their tasks to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.udp_task.await;
        let _ = self.tcp_task.await;
    }
}

async fn serve_udp<S: StateStore>(
    socket: Arc<UdpSocket>,
    backend: Arc<Backend<S>>,
    signer: Arc<ZoneSigner>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("dns: udp recv error: {e}");
                        continue;
                    }
                };
                let query = buf[..len].to_vec();
                let socket = Arc::clone(&socket);
                let backend = Arc::clone(&backend);
                let signer = Arc::clone(&signer);
                tokio::spawn(async move {
                    if let Some(bytes) = handle_wire(&query, &backend, &signer).await {
                        let _ = socket.send_to(&bytes, src).await;
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn serve_tcp<S: StateStore>(
    listener: TcpListener,
    backend: Arc<Backend<S>>,
    signer: Arc<ZoneSigner>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, src) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("dns: tcp accept error: {e}");
                        continue;
                    }
                };
                let backend = Arc::clone(&backend);
                let signer = Arc::clone(&signer);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_tcp_conn(stream, &backend, &signer, cancel).await {
                        tracing::debug!(addr = %src, "dns: tcp connection ended: {e}");
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// One TCP connection: length-prefixed messages until EOF or idle timeout.
async fn serve_tcp_conn<S: StateStore>(
    mut stream: tokio::net::TcpStream,
    backend: &Backend<S>,
    signer: &ZoneSigner,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            r = tokio::time::timeout(TCP_READ_TIMEOUT, stream.read_exact(&mut len_buf)) => r,
            _ = cancel.cancelled() => return Ok(()),
        };
        match read {
            Ok(Ok(_)) => {}
            // Idle timeout or EOF closes the connection quietly.
            _ => return Ok(()),
        }

        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        if let Some(bytes) = handle_wire(&query, backend, signer).await {
            stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
            stream.write_all(&bytes).await?;
        }
    }
}

/// Decode, answer, encode. Returns `None` for unparseable garbage.
async fn handle_wire<S: StateStore>(
    query: &[u8],
    backend: &Backend<S>,
    signer: &ZoneSigner,
) -> Option<Vec<u8>> {
    let msg = match Message::from_bytes(query) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("dns: malformed query: {e}");
            return None;
        }
    };
    let resp = answer_query(&msg, backend, signer).await;
    match resp.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::debug!("dns: failed to serialize response: {e}");
            None
        }
    }
}

/// Build the (signed) response for one query message.
pub async fn answer_query<S: StateStore>(
    msg: &Message,
    backend: &Backend<S>,
    signer: &ZoneSigner,
) -> Message {
    let mut resp = response_from(msg);

    let query = match msg.queries().first() {
        Some(q) => q,
        None => {
            resp.set_response_code(ResponseCode::FormErr);
            return resp;
        }
    };

    let qname = canonical_qname(&query.name().to_string());
    if !backend.in_zone(&qname) {
        resp.set_response_code(ResponseCode::Refused);
        return resp;
    }

    let qtype = u16::from(query.query_type());
    let records = match backend.lookup(&qname).await {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(qname = %qname, "dns: lookup failed: {e}");
            resp.set_response_code(ResponseCode::ServFail);
            return resp;
        }
    };

    // One qtype → at most one RRset to sign.
    let answers: Vec<Record> =
        records.into_iter().filter(|r| u16::from(r.record_type()) == qtype).collect();

    resp.set_authoritative(true);
    if answers.is_empty() {
        add_nodata_authority(&mut resp, &qname, backend, signer);
    } else {
        match signer.sign_rrset(&answers) {
            Ok(rrsig) => {
                for answer in answers {
                    resp.add_answer(answer);
                }
                resp.add_answer(rrsig);
            }
            Err(e) => {
                tracing::warn!(qname = %qname, "dns: signing failed: {e}");
                resp.set_response_code(ResponseCode::ServFail);
                return resp;
            }
        }
    }

    if msg.edns().is_some() {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        edns.set_version(0);
        edns.set_dnssec_ok(true);
        resp.set_edns(edns);
    }

    resp
}

/// NODATA: prove the absence with the SOA and a minimal NSEC, both signed.
fn add_nodata_authority<S: StateStore>(
    resp: &mut Message,
    qname: &str,
    backend: &Backend<S>,
    signer: &ZoneSigner,
) {
    if let Some(soa) = backend.soa() {
        let soa_set = vec![soa.clone()];
        if let Ok(rrsig) = signer.sign_rrset(&soa_set) {
            for r in soa_set {
                resp.add_name_server(r);
            }
            resp.add_name_server(rrsig);
        }
    }

    if let Ok(name) = hickory_proto::rr::Name::from_utf8(qname)
        && let Ok(nsec) = signer.nsec_nodata(&name)
    {
        let nsec_set = vec![nsec];
        if let Ok(rrsig) = signer.sign_rrset(&nsec_set) {
            for r in nsec_set {
                resp.add_name_server(r);
            }
            resp.add_name_server(rrsig);
        }
    }
}

/// Response skeleton: copied ID and queries, response flag set.
fn response_from(query: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(query.id());
    resp.set_message_type(MessageType::Response);
    resp.set_recursion_desired(query.recursion_desired());
    resp.set_recursion_available(false);
    for q in query.queries() {
        resp.add_query(q.clone());
    }
    resp
}

fn canonical_qname(name: &str) -> String {
    let mut qname = name.to_lowercase();
    if !qname.ends_with('.') {
        qname.push('.');
    }
    qname
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::{add_caa_records, parse_zone};
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
    use pinhost_store::{LocalStore, StateStore as _};

    const PIN: &str = "9b7d8f4b4f45183149c1b666d08d1f8c.bfcd0704a087908e509c39b1c2b98cc5";

    const ZONE: &str = "\
$TTL 300
@   IN SOA ns1.tls.example. ops.tls.example. 2024010101 7200 3600 1209600 300
@   IN NS  ns1.tls.example.
@   IN A   192.0.2.80
";

    fn make_query(name: &str, rtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(4321);
        msg.set_message_type(MessageType::Query);
        let mut query = Query::new();
        query.set_name(Name::from_utf8(name).unwrap());
        query.set_query_type(rtype);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
        msg
    }

    fn signer() -> Arc<ZoneSigner> {
        let dir = tempfile::tempdir().unwrap();
        let signer = ZoneSigner::load_or_generate(&dir.path().join("dns-key"), "tls.example");
        Arc::new(signer.unwrap())
    }

    async fn fixture() -> (Arc<Backend<LocalStore>>, Arc<ZoneSigner>, LocalStore) {
        let store = LocalStore::new();
        let signer = signer();
        let mut zone = parse_zone(ZONE, "tls.example").unwrap();
        add_caa_records(&mut zone, "tls.example", "letsencrypt.org").unwrap();
        crate::zone::push_record(&mut zone, "tls.example.", signer.dnskey_record());
        crate::zone::push_record(&mut zone, "tls.example.", signer.cdnskey_record());
        crate::zone::push_record(&mut zone, "tls.example.", signer.cds_record());
        let backend =
            Backend::new("tls.example", zone, store.clone()).unwrap().into_shared();
        (backend, signer, store)
    }

    #[tokio::test]
    async fn apex_a_query_is_signed() {
        let (backend, signer, _) = fixture().await;
        let resp =
            answer_query(&make_query("tls.example.", RecordType::A), &backend, &signer).await;
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.authoritative());

        let types: Vec<RecordType> = resp.answers().iter().map(|r| r.record_type()).collect();
        assert!(types.contains(&RecordType::A));
        assert!(types.contains(&RecordType::RRSIG));
    }

    #[tokio::test]
    async fn synthesized_a_query_carries_rrsig() {
        let (backend, signer, _) = fixture().await;
        let qname = format!("127-0-0-1.{PIN}.tls.example.");
        let resp = answer_query(&make_query(&qname, RecordType::A), &backend, &signer).await;

        let a: Vec<_> =
            resp.answers().iter().filter(|r| r.record_type() == RecordType::A).collect();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].ttl(), 2_592_000);
        let RData::A(A(ip)) = a[0].data().unwrap() else { panic!("expected A") };
        assert_eq!(*ip, std::net::Ipv4Addr::LOCALHOST);
        assert!(resp.answers().iter().any(|r| r.record_type() == RecordType::RRSIG));
    }

    #[tokio::test]
    async fn validation_txt_round_trip() {
        let (backend, signer, store) = fixture().await;
        let qname = format!("_acme-challenge.{PIN}.tls.example.");
        store.validation_set(&qname, "tok123").await.unwrap();

        let resp = answer_query(&make_query(&qname, RecordType::TXT), &backend, &signer).await;
        let txt: Vec<_> =
            resp.answers().iter().filter(|r| r.record_type() == RecordType::TXT).collect();
        assert_eq!(txt.len(), 1);
        assert_eq!(txt[0].ttl(), 0);
    }

    #[tokio::test]
    async fn missing_validation_is_nodata_with_nsec() {
        let (backend, signer, _) = fixture().await;
        let qname = format!("_acme-challenge.{PIN}.tls.example.");
        let resp = answer_query(&make_query(&qname, RecordType::TXT), &backend, &signer).await;

        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.answers().is_empty());
        let authority_types: Vec<RecordType> =
            resp.name_servers().iter().map(|r| r.record_type()).collect();
        assert!(authority_types.contains(&RecordType::SOA));
        assert!(authority_types.contains(&RecordType::NSEC));
        assert!(authority_types.contains(&RecordType::RRSIG));
    }

    #[tokio::test]
    async fn out_of_zone_is_refused() {
        let (backend, signer, _) = fixture().await;
        let resp =
            answer_query(&make_query("example.org.", RecordType::A), &backend, &signer).await;
        assert_eq!(resp.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn dnskey_is_served_from_apex() {
        let (backend, signer, _) = fixture().await;
        let resp =
            answer_query(&make_query("tls.example.", RecordType::DNSKEY), &backend, &signer)
                .await;
        assert!(resp.answers().iter().any(|r| r.record_type() == RecordType::DNSKEY));
        assert!(resp.answers().iter().any(|r| r.record_type() == RecordType::RRSIG));
    }

    #[tokio::test]
    async fn udp_server_end_to_end() {
        let (backend, signer, _) = fixture().await;
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        // Bind on an ephemeral port for the test.
        let udp = UdpSocket::bind(addr).await.unwrap();
        let server_addr = udp.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_udp(
            Arc::new(udp),
            Arc::clone(&backend),
            Arc::clone(&signer),
            cancel.clone(),
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = make_query("tls.example.", RecordType::A).to_vec().unwrap();
        client.send_to(&query, server_addr).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let resp = Message::from_bytes(&buf[..len]).unwrap();
        assert_eq!(resp.id(), 4321);
        assert!(!resp.answers().is_empty());

        cancel.cancel();
        let _ = task.await;
    }
}
