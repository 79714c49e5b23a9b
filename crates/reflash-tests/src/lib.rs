//! Test support for the reflash client
//!
//! The integration tests in `tests/` run the real client stack against
//! [`SimulatedEcu`], an in-process bootloader stand-in. The simulator is
//! installed as the dynamic responder of a
//! [`MockCanAdapter`](reflash_uds::transport::mock::MockCanAdapter): it
//! reassembles segmented requests per source ID, dispatches each UDS
//! service against its own session, security and download state, and
//! answers on the physical or functional reply ID resolved from the same
//! configuration the client runs with.
//!
//! Failure injection hooks ([`SimulatedEcu::reject_service`],
//! [`SimulatedEcu::fail_routine`], [`SimulatedEcu::cancel_after_requests`])
//! let the tests drive the error and cancellation paths deterministically,
//! and the inspection accessors expose what the ECU ended up with after a
//! run.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use reflash_uds::config::{parse_hex_id, ClientConfig, SecurityAlgorithm};
use reflash_uds::frame::{segment, CanFrame, Reassembler, Reassembly};
use reflash_uds::security;
use reflash_uds::transport::mock::MockCanAdapter;
use reflash_uds::worker::CancelFlag;

/// An open download window between RequestDownload and RequestTransferExit.
struct Download {
    address: u32,
    size: u32,
    buffer: Vec<u8>,
    blocks: usize,
}

/// Trips a cancellation flag when the n-th request for a service arrives.
struct CancelTrigger {
    service: u8,
    remaining: u32,
    flag: CancelFlag,
}

#[derive(Default)]
struct EcuState {
    assemblers: HashMap<u32, Reassembler>,
    session: u8,
    pending_seed: Option<(u8, Vec<u8>)>,
    unlocked: bool,
    parameters: HashMap<u16, Vec<u8>>,
    written: HashMap<u16, Vec<u8>>,
    routines: Vec<(u16, Vec<u8>)>,
    download: Option<Download>,
    flashed: Option<(u32, Vec<u8>)>,
    transfer_blocks: usize,
    resets: u32,
    dtc_clears: u32,
    rejections: HashMap<u8, u8>,
    routine_failures: HashMap<u16, u8>,
    triggers: Vec<CancelTrigger>,
}

/// Frame-level UDS bootloader simulation.
///
/// Listens on the physical and functional request IDs, ignores everything
/// else (wake-up frames included). Sessions, security access, download
/// bookkeeping and the block sequence counter follow the same rules the
/// client expects from a real ECU, so the full reflash sequence and the
/// scenario rounds pass against it unmodified.
pub struct SimulatedEcu {
    physical_rx: u32,
    physical_tx: u32,
    functional_rx: u32,
    functional_tx: u32,
    algorithm: SecurityAlgorithm,
    counter_start: u8,
    counter_wrap: u8,
    state: Mutex<EcuState>,
}

impl SimulatedEcu {
    /// Build a simulator matching the addressing, security and flash
    /// parameters of `config`.
    pub fn new(config: &ClientConfig) -> Self {
        let physical_rx =
            parse_hex_id(&config.addressing.physical_request_id).expect("physical request id");
        let mut parameters = HashMap::new();
        parameters.insert(0xF190, b"WREFLASH000000001".to_vec());

        Self {
            physical_rx,
            physical_tx: physical_rx + config.addressing.physical_response_offset,
            functional_rx: parse_hex_id(&config.addressing.functional_request_id)
                .expect("functional request id"),
            functional_tx: parse_hex_id(&config.addressing.functional_response_start)
                .expect("functional response id"),
            algorithm: config.security.algorithm,
            counter_start: config.flash.block_counter_start,
            counter_wrap: config.flash.block_counter_wrap,
            state: Mutex::new(EcuState {
                session: 0x01,
                parameters,
                ..EcuState::default()
            }),
        }
    }

    /// Wire the simulator into a mock adapter. Every frame the client puts
    /// on the bus that no scripted rule claims is handed to
    /// [`Self::handle_frame`].
    pub fn install(self: Arc<Self>, adapter: &MockCanAdapter) {
        adapter.set_responder(move |frame| self.handle_frame(frame));
    }

    /// Feed one raw frame and collect the response frames, if any.
    ///
    /// Frames on unknown IDs are ignored. Segmented requests produce their
    /// response when the last consecutive frame completes the message.
    pub fn handle_frame(&self, frame: CanFrame) -> Vec<CanFrame> {
        let reply_id = if frame.id() == self.physical_rx {
            self.physical_tx
        } else if frame.id() == self.functional_rx {
            self.functional_tx
        } else {
            return Vec::new();
        };

        let mut state = self.state.lock();
        let request = match state.assemblers.entry(frame.id()).or_default().feed(&frame) {
            Ok(Reassembly::Complete(request)) => request,
            Ok(Reassembly::Incomplete) => return Vec::new(),
            Err(_) => {
                state.assemblers.remove(&frame.id());
                return Vec::new();
            }
        };

        let response = self.process_request(&mut state, &request);
        self.fire_triggers(&mut state, request[0]);
        segment(reply_id, &response).expect("response fits the codec")
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Answer every request for `service` with the given negative response
    /// code instead of processing it.
    pub fn reject_service(&self, service: u8, nrc: u8) {
        self.state.lock().rejections.insert(service, nrc);
    }

    /// Let routine `rid` start but append the given non-zero status byte to
    /// its positive response.
    pub fn fail_routine(&self, rid: u16, status: u8) {
        self.state.lock().routine_failures.insert(rid, status);
    }

    /// Trip `flag` once the `count`-th request for `service` has arrived.
    /// That request is still answered normally, so a cooperative stop takes
    /// effect at the caller's next checkpoint.
    pub fn cancel_after_requests(&self, service: u8, count: u32, flag: CancelFlag) {
        self.state.lock().triggers.push(CancelTrigger {
            service,
            remaining: count,
            flag,
        });
    }

    /// Seed or replace a readable data identifier.
    pub fn set_parameter(&self, did: u16, data: &[u8]) {
        self.state.lock().parameters.insert(did, data.to_vec());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Active diagnostic session (0x01 default, 0x02 programming, 0x03
    /// extended).
    pub fn session(&self) -> u8 {
        self.state.lock().session
    }

    pub fn security_unlocked(&self) -> bool {
        self.state.lock().unlocked
    }

    /// Image accepted by the last completed transfer, if any.
    pub fn flashed_image(&self) -> Option<Vec<u8>> {
        self.state.lock().flashed.clone().map(|(_, image)| image)
    }

    /// Address the last completed transfer was downloaded to.
    pub fn flashed_address(&self) -> Option<u32> {
        self.state.lock().flashed.as_ref().map(|(address, _)| *address)
    }

    /// Payload of the last WriteDataByIdentifier for `did`.
    pub fn written_data(&self, did: u16) -> Option<Vec<u8>> {
        self.state.lock().written.get(&did).cloned()
    }

    /// Every started routine as `(rid, args)`, in call order.
    pub fn routines_started(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().routines.clone()
    }

    /// Number of TransferData blocks accepted across the whole run.
    pub fn transfer_blocks(&self) -> usize {
        self.state.lock().transfer_blocks
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().resets
    }

    pub fn dtc_clears(&self) -> u32 {
        self.state.lock().dtc_clears
    }

    // =========================================================================
    // Service dispatch
    // =========================================================================

    fn process_request(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = request[0];
        if let Some(&nrc) = state.rejections.get(&sid) {
            return negative_response(sid, nrc);
        }

        match sid {
            0x10 => self.handle_session_control(state, request),
            0x11 => self.handle_ecu_reset(state, request),
            0x14 => self.handle_clear_dtc(state, request),
            0x22 => self.handle_read_data(state, request),
            0x27 => self.handle_security_access(state, request),
            0x28 => handle_comm_control(request),
            0x2E => self.handle_write_data(state, request),
            0x31 => self.handle_routine_control(state, request),
            0x34 => self.handle_request_download(state, request),
            0x36 => self.handle_transfer_data(state, request),
            0x37 => self.handle_transfer_exit(state, request),
            0x85 => handle_dtc_setting(request),
            _ => negative_response(sid, 0x11),
        }
    }

    fn fire_triggers(&self, state: &mut EcuState, service: u8) {
        for trigger in &mut state.triggers {
            if trigger.service == service && trigger.remaining > 0 {
                trigger.remaining -= 1;
                if trigger.remaining == 0 {
                    trigger.flag.cancel();
                }
            }
        }
    }

    fn handle_session_control(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let Some(&sub) = request.get(1) else {
            return negative_response(0x10, 0x13);
        };
        let session = sub & 0x7F;
        if !matches!(session, 0x01 | 0x02 | 0x03) {
            return negative_response(0x10, 0x12);
        }

        state.session = session;
        state.pending_seed = None;
        state.unlocked = false;
        if session == 0x01 {
            state.download = None;
        }
        // Sub-function echo (suppress bit included) plus P2/P2* timings.
        positive_response(0x10, &[sub, 0x00, 0x19, 0x01, 0xF4])
    }

    fn handle_ecu_reset(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let Some(&sub) = request.get(1) else {
            return negative_response(0x11, 0x13);
        };
        state.session = 0x01;
        state.pending_seed = None;
        state.unlocked = false;
        state.download = None;
        state.resets += 1;
        positive_response(0x11, &[sub])
    }

    fn handle_clear_dtc(&self, state: &mut EcuState, _request: &[u8]) -> Vec<u8> {
        state.dtc_clears += 1;
        positive_response(0x14, &[])
    }

    fn handle_read_data(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let Some(did) = did_of(request) else {
            return negative_response(0x22, 0x13);
        };
        match state.parameters.get(&did) {
            Some(data) => {
                let mut payload = did.to_be_bytes().to_vec();
                payload.extend_from_slice(data);
                positive_response(0x22, &payload)
            }
            None => negative_response(0x22, 0x31),
        }
    }

    fn handle_security_access(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let Some(&sub) = request.get(1) else {
            return negative_response(0x27, 0x13);
        };

        if sub % 2 == 1 {
            // Seed request: issue a fresh non-zero seed for this level.
            let mut seed = [0u8; 4];
            while seed.iter().all(|&b| b == 0) {
                seed = rand::thread_rng().gen();
            }
            state.pending_seed = Some((sub, seed.to_vec()));
            let mut payload = vec![sub];
            payload.extend_from_slice(&seed);
            positive_response(0x27, &payload)
        } else {
            let Some((level, seed)) = state.pending_seed.take() else {
                return negative_response(0x27, 0x24);
            };
            if level != sub.wrapping_sub(1) {
                return negative_response(0x27, 0x24);
            }
            if request[2..] == security::derive_key(self.algorithm, &seed)[..] {
                state.unlocked = true;
                positive_response(0x27, &[sub])
            } else {
                negative_response(0x27, 0x35)
            }
        }
    }

    fn handle_write_data(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let Some(did) = did_of(request) else {
            return negative_response(0x2E, 0x13);
        };
        if !state.unlocked {
            return negative_response(0x2E, 0x33);
        }
        state.written.insert(did, request[3..].to_vec());
        positive_response(0x2E, &did.to_be_bytes())
    }

    fn handle_routine_control(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        if request.get(1) != Some(&0x01) {
            return negative_response(0x31, 0x12);
        }
        let (Some(&hi), Some(&lo)) = (request.get(2), request.get(3)) else {
            return negative_response(0x31, 0x13);
        };
        let rid = u16::from_be_bytes([hi, lo]);
        state.routines.push((rid, request[4..].to_vec()));

        let mut payload = vec![0x01, hi, lo];
        if let Some(&status) = state.routine_failures.get(&rid) {
            payload.push(status);
        }
        positive_response(0x31, &payload)
    }

    fn handle_request_download(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        if state.session != 0x02 {
            return negative_response(0x34, 0x22);
        }
        if !state.unlocked {
            return negative_response(0x34, 0x33);
        }
        if request.len() < 10 || request[1] != 0x44 {
            return negative_response(0x34, 0x13);
        }

        let address = u32::from_be_bytes([request[2], request[3], request[4], request[5]]);
        let size = u32::from_be_bytes([request[6], request[7], request[8], request[9]]);
        state.download = Some(Download {
            address,
            size,
            buffer: Vec::with_capacity(size as usize),
            blocks: 0,
        });
        // Length format 0x20: two bytes of maxNumberOfBlockLength follow.
        positive_response(0x34, &[0x20, 0x10, 0x02])
    }

    fn handle_transfer_data(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let Some(&counter) = request.get(1) else {
            return negative_response(0x36, 0x13);
        };
        let Some(download) = state.download.as_mut() else {
            return negative_response(0x36, 0x24);
        };

        let expected = (self.counter_start as usize + download.blocks) % self.counter_wrap as usize;
        if counter != expected as u8 {
            return negative_response(0x36, 0x73);
        }

        download.buffer.extend_from_slice(&request[2..]);
        download.blocks += 1;
        state.transfer_blocks += 1;
        positive_response(0x36, &[counter])
    }

    fn handle_transfer_exit(&self, state: &mut EcuState, _request: &[u8]) -> Vec<u8> {
        let Some(download) = state.download.take() else {
            return negative_response(0x37, 0x24);
        };
        if download.buffer.len() != download.size as usize {
            return negative_response(0x37, 0x24);
        }
        state.flashed = Some((download.address, download.buffer));
        positive_response(0x37, &[])
    }
}

fn handle_comm_control(request: &[u8]) -> Vec<u8> {
    match request.get(1) {
        Some(&sub) => positive_response(0x28, &[sub]),
        None => negative_response(0x28, 0x13),
    }
}

fn handle_dtc_setting(request: &[u8]) -> Vec<u8> {
    match request.get(1) {
        Some(&sub) => positive_response(0x85, &[sub]),
        None => negative_response(0x85, 0x13),
    }
}

fn did_of(request: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*request.get(1)?, *request.get(2)?]))
}

fn positive_response(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut response = vec![sid + 0x40];
    response.extend_from_slice(data);
    response
}

fn negative_response(sid: u8, nrc: u8) -> Vec<u8> {
    vec![0x7F, sid, nrc]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ecu() -> SimulatedEcu {
        SimulatedEcu::new(&ClientConfig::default())
    }

    /// Push one logical request through the frame interface and decode the
    /// reply.
    fn exchange(ecu: &SimulatedEcu, request: &[u8]) -> Vec<u8> {
        let frames = segment(0x713, request).expect("request fits the codec");
        let mut responses = Vec::new();
        for frame in frames {
            responses.extend(ecu.handle_frame(frame));
        }

        let mut rx = Reassembler::new();
        let mut message = None;
        for frame in &responses {
            if let Reassembly::Complete(m) = rx.feed(frame).expect("well-formed response") {
                message = Some(m);
            }
        }
        message.expect("ECU did not answer")
    }

    #[test]
    fn test_session_control_echoes_sub_and_timings() {
        let ecu = ecu();
        let response = exchange(&ecu, &[0x10, 0x03]);
        assert_eq!(response, vec![0x50, 0x03, 0x00, 0x19, 0x01, 0xF4]);
        assert_eq!(ecu.session(), 0x03);
    }

    #[test]
    fn test_security_handshake_with_derived_key() {
        let ecu = ecu();
        let seed_response = exchange(&ecu, &[0x27, 0x11]);
        assert_eq!(seed_response[..2], [0x67, 0x11]);
        let seed = &seed_response[2..];
        assert_eq!(seed.len(), 4);
        assert!(seed.iter().any(|&b| b != 0));

        let mut key_request = vec![0x27, 0x12];
        key_request.extend_from_slice(&security::derive_key(SecurityAlgorithm::Cfb, seed));
        assert_eq!(exchange(&ecu, &key_request), vec![0x67, 0x12]);
        assert!(ecu.security_unlocked());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let ecu = ecu();
        let seed = exchange(&ecu, &[0x27, 0x11])[2..].to_vec();

        let mut key = security::derive_key(SecurityAlgorithm::Cfb, &seed);
        key[0] ^= 0xFF;
        let mut key_request = vec![0x27, 0x12];
        key_request.extend_from_slice(&key);

        assert_eq!(exchange(&ecu, &key_request), vec![0x7F, 0x27, 0x35]);
        assert!(!ecu.security_unlocked());
    }

    #[test]
    fn test_unknown_did_rejected() {
        let ecu = ecu();
        assert_eq!(exchange(&ecu, &[0x22, 0xAB, 0xCD]), vec![0x7F, 0x22, 0x31]);
    }

    #[test]
    fn test_segmented_request_answers_on_completion() {
        let ecu = ecu();
        let frames = segment(0x713, &[0x2E, 0xF1, 0x84, 1, 2, 3, 4, 5, 6, 7, 8, 9])
            .expect("request fits the codec");
        assert_eq!(frames.len(), 2);

        assert!(ecu.handle_frame(frames[0]).is_empty());
        let response = ecu.handle_frame(frames[1]);
        assert_eq!(response.len(), 1);
        // Locked ECU refuses the write once the message completes.
        assert_eq!(response[0].data()[..4], [0x03, 0x7F, 0x2E, 0x33]);
    }

    #[test]
    fn test_download_gated_on_session_and_unlock() {
        let ecu = ecu();
        let mut download = vec![0x34, 0x44];
        download.extend_from_slice(&0x0800_0000u32.to_be_bytes());
        download.extend_from_slice(&64u32.to_be_bytes());

        assert_eq!(exchange(&ecu, &download), vec![0x7F, 0x34, 0x22]);

        exchange(&ecu, &[0x10, 0x02]);
        assert_eq!(exchange(&ecu, &download), vec![0x7F, 0x34, 0x33]);
    }

    #[test]
    fn test_wrong_block_counter_rejected() {
        let ecu = ecu();
        exchange(&ecu, &[0x10, 0x02]);
        let seed = exchange(&ecu, &[0x27, 0x11])[2..].to_vec();
        let mut key_request = vec![0x27, 0x12];
        key_request.extend_from_slice(&security::derive_key(SecurityAlgorithm::Cfb, &seed));
        exchange(&ecu, &key_request);

        let mut download = vec![0x34, 0x44];
        download.extend_from_slice(&0x0800_0000u32.to_be_bytes());
        download.extend_from_slice(&4u32.to_be_bytes());
        assert_eq!(exchange(&ecu, &download)[0], 0x74);

        // The first block must carry the configured start counter.
        assert_eq!(exchange(&ecu, &[0x36, 0x05, 0xAA]), vec![0x7F, 0x36, 0x73]);
        assert_eq!(
            exchange(&ecu, &[0x36, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]),
            vec![0x76, 0x01]
        );
        assert_eq!(ecu.transfer_blocks(), 1);
    }
}
