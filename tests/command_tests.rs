//! Full feature phase: receive dispatch, responses and send coalescing

mod common;

use common::*;
use iser_target::proto::{iser_flags, opcode, BHS_SIZE, ISER_HDR_LEN, ISER_HEADERS_LEN};
use iser_target::soft::SoftRdma;
use iser_target::verbs::WrOpcode;
use iser_target::{CmdTag, ConnState, Connection, IserHeader, IsertError, ResponseState};
use proptest::prelude::*;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn itt_of(bytes: &[u8]) -> u32 {
    let bhs = &bytes[ISER_HDR_LEN..ISER_HEADERS_LEN];
    u32::from_be_bytes([bhs[16], bhs[17], bhs[18], bhs[19]])
}

/// Signaled flags of the sends posted after the first `skip`
fn signaled_after(fx: &Fixture, conn: &Connection, skip: usize) -> Vec<bool> {
    fx.soft
        .send_log(conn.qp_num())
        .into_iter()
        .skip(skip)
        .filter(|wr| matches!(wr.opcode, WrOpcode::Send))
        .map(|wr| wr.signaled)
        .collect()
}

fn coalescing_fixture(batch: usize) -> Fixture {
    Fixture::new(SoftRdma::direct_attr(), test_config().with_comp_batch_count(batch))
}

// ============================================================================
// Receive dispatch
// ============================================================================

#[test]
fn test_dispatch_by_opcode() {
    let fx = Fixture::direct();
    let conn = fx.up();

    fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), opcode::NOP_OUT, 1, &[]));
    fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), opcode::SCSI_DATA_OUT, 2, b"abcd"));
    fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), opcode::TASK_MANAGEMENT_REQUEST, 3, &[]));

    let received = fx.target.received();
    assert_eq!(received.len(), 3);
    assert_eq!(received[0].opcode, opcode::NOP_OUT);
    assert!(received[0].cmd.is_some());
    assert_eq!(received[1].opcode, opcode::SCSI_DATA_OUT);
    assert_eq!(received[1].cmd, None);
    assert_eq!(received[1].data, b"abcd");
    assert_eq!(received[2].opcode, opcode::TASK_MANAGEMENT_REQUEST);
    assert!(received[2].cmd.is_some());

    assert_eq!(conn.command_count(), 2);
    let info = conn.command_info(received[0].cmd.unwrap()).unwrap();
    assert_eq!(info.itt, 1);
    assert_eq!(info.opcode, opcode::NOP_OUT);
    assert!(!info.in_flight);
}

#[test]
fn test_unknown_opcode_dropped() {
    let fx = Fixture::direct();
    let conn = fx.up();

    // SNACK is not something this transport hands up
    fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), 0x10, 1, &[]));
    fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), 0x1c, 2, &[]));

    assert!(fx.target.received().is_empty());
    assert_eq!(conn.command_count(), 0);
    assert_eq!(conn.state(), ConnState::Up);
}

#[test]
fn test_hello_messages_ignored() {
    let fx = Fixture::direct();
    let conn = fx.up();

    let hello = IserHeader { flags: iser_flags::HELLO, ..Default::default() };
    fx.deliver(&conn, &pdu_bytes(&hello, opcode::NOP_OUT, 1, &[]));
    assert!(fx.target.received().is_empty());

    // Unknown message types are still dispatched
    let odd = IserHeader { flags: 0x70, ..Default::default() };
    fx.deliver(&conn, &pdu_bytes(&odd, opcode::NOP_OUT, 2, &[]));
    assert_eq!(fx.target.received().len(), 1);
}

#[test]
fn test_immediate_data_delivered() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let data = pattern(test_config().max_recv_data_segment_length, 3);

    fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), opcode::SCSI_COMMAND, 0x40, &data));
    let received = fx.target.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].data, data);
}

#[test]
fn test_refused_pdu_releases_command() {
    let fx = Fixture::direct();
    let conn = fx.up();
    fx.target.refuse_itt(7);

    fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), opcode::SCSI_COMMAND, 7, &[]));
    let tag = fx.target.tag_for(7).unwrap();
    assert_eq!(fx.target.released(), vec![tag]);
    assert_eq!(conn.command_count(), 0);
    assert!(conn.command_info(tag).is_none());
}

#[test]
fn test_command_contexts_bounded() {
    let fx = Fixture::new(SoftRdma::direct_attr(), test_config().with_max_commands(2));
    let conn = fx.up();

    for itt in 0..3 {
        fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), opcode::SCSI_COMMAND, itt, &[]));
    }
    assert_eq!(fx.target.received().len(), 2);
    assert_eq!(conn.command_count(), 2);
    assert_eq!(conn.state(), ConnState::Up);
}

#[test]
fn test_receive_ring_replenished() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let ring = test_config().recv_ring_size;

    for i in 0..(3 * ring) {
        let data = pattern(16 + i, i as u8);
        fx.deliver(&conn, &pdu_bytes(&IserHeader::ctrl(), opcode::SCSI_DATA_OUT, i as u32, &data));

        let outstanding = conn.outstanding_receives();
        assert!(outstanding > 0 && outstanding <= ring, "{} receives outstanding", outstanding);
        assert_eq!(outstanding, fx.soft.posted_recvs(conn.qp_num()));
        assert_eq!(fx.target.received()[i].data, data);
    }
}

// ============================================================================
// Responses
// ============================================================================

#[test]
fn test_status_with_sense_data() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let sense = [0x70, 0, 0x05, 0, 0, 0, 0, 0x0a];
    fx.target.set_sense(5, &sense);
    let tag = fx.scsi_command(&conn, 5);

    fx.transport.queue_response(&conn, tag, ResponseState::Status).unwrap();
    assert!(conn.command_info(tag).unwrap().in_flight);
    assert_eq!(conn.outstanding_sends(), 1);
    fx.process(&conn);

    let sent = fx.soft.take_sent(conn.qp_num());
    assert_eq!(sent.len(), 1);
    let bytes = &sent[0].bytes;
    assert_eq!(bytes[ISER_HDR_LEN], opcode::SCSI_RESPONSE);
    assert_eq!(itt_of(bytes), 5);
    // SenseLength, sense bytes, padding
    assert_eq!(bytes.len(), ISER_HEADERS_LEN + 12);
    assert_eq!(&bytes[ISER_HEADERS_LEN..ISER_HEADERS_LEN + 2], &[0, 8]);
    assert_eq!(&bytes[ISER_HEADERS_LEN + 2..ISER_HEADERS_LEN + 10], &sense);

    assert_eq!(fx.target.released(), vec![tag]);
    assert_eq!(conn.command_count(), 0);
    assert_eq!(conn.outstanding_sends(), 0);
}

#[test]
fn test_immediate_queue_nop_in_only() {
    let fx = coalescing_fixture(4);
    let conn = fx.up();
    let tag = fx.command(&conn, &IserHeader::ctrl(), opcode::NOP_OUT, 9);

    let result = fx.transport.queue_immediate(&conn, tag, ResponseState::Status);
    assert!(matches!(result, Err(IsertError::InvalidState(_))));

    let skip = fx.soft.send_log(conn.qp_num()).len();
    fx.transport.queue_immediate(&conn, tag, ResponseState::NopIn).unwrap();
    // Never coalesced
    assert_eq!(signaled_after(&fx, &conn, skip), vec![true]);
    fx.process(&conn);

    let sent = fx.soft.take_sent(conn.qp_num());
    assert_eq!(sent[0].bytes[ISER_HDR_LEN], opcode::NOP_IN);
    assert_eq!(sent[0].bytes.len(), ISER_HEADERS_LEN);
    assert_eq!(fx.target.released(), vec![tag]);
}

#[test]
fn test_text_response_completes_through_deferred_worker() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let tag = fx.command(&conn, &IserHeader::ctrl(), opcode::TEXT_REQUEST, 10);

    fx.transport.queue_response(&conn, tag, ResponseState::TextResponse).unwrap();
    fx.process(&conn);

    assert!(wait_until(WAIT, || fx.target.released().contains(&tag)));
    assert_eq!(fx.target.control(), vec![(tag, ResponseState::TextResponse)]);

    let sent = fx.soft.take_sent(conn.qp_num());
    let bytes = &sent[0].bytes;
    assert_eq!(bytes[ISER_HDR_LEN], opcode::TEXT_RESPONSE);
    assert_eq!(bytes.len(), ISER_HEADERS_LEN + 32);
    assert_eq!(&bytes[ISER_HEADERS_LEN..ISER_HEADERS_LEN + TEXT_RESPONSE_DATA.len()], TEXT_RESPONSE_DATA);
    assert!(bytes[ISER_HEADERS_LEN + TEXT_RESPONSE_DATA.len()..].iter().all(|b| *b == 0));
}

#[test]
fn test_reject_carries_bhs() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let tag = fx.scsi_command(&conn, 11);

    fx.transport.queue_response(&conn, tag, ResponseState::Reject).unwrap();
    fx.process(&conn);

    assert!(wait_until(WAIT, || fx.target.control().len() == 1));
    let sent = fx.soft.take_sent(conn.qp_num());
    assert_eq!(sent[0].bytes[ISER_HDR_LEN], opcode::REJECT);
    assert_eq!(sent[0].bytes.len(), ISER_HEADERS_LEN + BHS_SIZE);
}

#[test]
fn test_logout_response_recorded() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let tag = fx.command(&conn, &IserHeader::ctrl(), opcode::LOGOUT_REQUEST, 12);
    assert!(!conn.logout_posted());

    fx.transport.queue_response(&conn, tag, ResponseState::LogoutResponse).unwrap();
    fx.process(&conn);

    assert!(conn.logout_posted());
    assert!(wait_until(WAIT, || fx.target.control() == vec![(tag, ResponseState::LogoutResponse)]));
    assert!(wait_until(WAIT, || conn.command_count() == 0));
}

#[test]
fn test_response_for_released_command_fails() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let tag = fx.scsi_command(&conn, 13);
    fx.transport.queue_response(&conn, tag, ResponseState::Status).unwrap();
    fx.process(&conn);

    let result = fx.transport.queue_response(&conn, tag, ResponseState::Status);
    assert!(matches!(result, Err(IsertError::InvalidState(_))));
    assert_eq!(conn.outstanding_sends(), 0);
}

#[test]
fn test_second_response_while_in_flight_refused() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let tag = fx.scsi_command(&conn, 14);
    fx.transport.queue_response(&conn, tag, ResponseState::Status).unwrap();
    let mappings = fx.soft.stats().mappings;

    let result = fx.transport.queue_response(&conn, tag, ResponseState::Status);
    assert!(matches!(result, Err(IsertError::InvalidState(_))));
    assert_eq!(fx.soft.stats().mappings, mappings);
    assert_eq!(conn.outstanding_sends(), 1);

    fx.process(&conn);
    assert_eq!(fx.target.released(), vec![tag]);
}

#[test]
fn test_post_failure_unwinds() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let tag = fx.scsi_command(&conn, 15);
    let mappings = fx.soft.stats().mappings;

    fx.soft.fail_next_post_send(1);
    let result = fx.transport.queue_response(&conn, tag, ResponseState::Status);
    assert!(matches!(result, Err(IsertError::PostFailed(_))));
    assert_eq!(conn.outstanding_sends(), 0);
    assert_eq!(conn.pending_coalesced(), 0);
    assert!(!conn.command_info(tag).unwrap().in_flight);
    assert_eq!(fx.soft.stats().mappings, mappings);
    assert_eq!(conn.state(), ConnState::Up);

    // The command can still be answered
    fx.transport.queue_response(&conn, tag, ResponseState::Status).unwrap();
    fx.process(&conn);
    assert_eq!(fx.target.released(), vec![tag]);
}

#[test]
fn test_response_mapping_failure_unwinds() {
    let fx = Fixture::direct();
    let conn = fx.up();
    let tag = fx.scsi_command(&conn, 16);

    fx.soft.fail_dma_map_after(0);
    let result = fx.transport.queue_response(&conn, tag, ResponseState::Status);
    fx.soft.clear_faults();

    assert!(matches!(result, Err(IsertError::Mapping(_))));
    assert_eq!(conn.outstanding_sends(), 0);
    assert!(!conn.command_info(tag).unwrap().in_flight);
}

// ============================================================================
// Send completion coalescing
// ============================================================================

fn queue_statuses(fx: &Fixture, conn: &Connection, first_itt: u32, n: usize) -> Vec<CmdTag> {
    let tags: Vec<CmdTag> = (0..n).map(|i| fx.scsi_command(conn, first_itt + i as u32)).collect();
    for tag in &tags {
        fx.transport.queue_response(conn, *tag, ResponseState::Status).unwrap();
    }
    tags
}

#[test]
fn test_every_kth_status_signaled() {
    let fx = coalescing_fixture(4);
    let conn = fx.up();
    let skip = fx.soft.send_log(conn.qp_num()).len();

    let tags = queue_statuses(&fx, &conn, 100, 5);
    assert_eq!(signaled_after(&fx, &conn, skip), vec![false, false, false, true, false]);
    assert_eq!(conn.pending_coalesced(), 1);
    assert_eq!(conn.outstanding_sends(), 5);

    fx.process(&conn);
    // The signaled send completes the three queued ahead of it
    let released = fx.target.released();
    assert_eq!(released, tags[..4].to_vec());
    assert_eq!(conn.outstanding_sends(), 1);
    assert_eq!(conn.command_count(), 1);

    let sent = fx.soft.take_sent(conn.qp_num());
    let itts: Vec<u32> = sent.iter().map(|m| itt_of(&m.bytes)).collect();
    assert_eq!(itts, vec![100, 101, 102, 103, 104]);
}

#[test]
fn test_uncoalesced_send_completes_pending_batch() {
    let fx = coalescing_fixture(4);
    let conn = fx.up();
    let skip = fx.soft.send_log(conn.qp_num()).len();

    let statuses = queue_statuses(&fx, &conn, 200, 2);
    let nop = fx.command(&conn, &IserHeader::ctrl(), opcode::NOP_OUT, 300);
    fx.transport.queue_immediate(&conn, nop, ResponseState::NopIn).unwrap();
    assert_eq!(signaled_after(&fx, &conn, skip), vec![false, false, true]);
    assert_eq!(conn.pending_coalesced(), 0);

    fx.process(&conn);
    let released = fx.target.released();
    assert_eq!(released, vec![statuses[0], statuses[1], nop]);
    assert_eq!(conn.outstanding_sends(), 0);
}

#[test]
fn test_pending_sends_resolved_at_teardown() {
    let fx = coalescing_fixture(8);
    let conn = fx.up();

    let tags = queue_statuses(&fx, &conn, 400, 3);
    fx.process(&conn);
    assert!(fx.target.released().is_empty());
    assert_eq!(conn.pending_coalesced(), 3);

    let handle = conn.clone();
    fx.transport.free_connection(conn).unwrap();
    assert_eq!(handle.state(), ConnState::Down);
    assert_eq!(handle.outstanding_sends(), 0);
    assert_eq!(handle.pending_coalesced(), 0);
    assert_eq!(fx.target.released(), tags);
    assert!(fx.target.lost().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_coalescing_resolves_every_send(batch in 1usize..6, n in 1usize..14) {
        let fx = coalescing_fixture(batch);
        let conn = fx.up();
        let skip = fx.soft.send_log(conn.qp_num()).len();

        let tags = queue_statuses(&fx, &conn, 1000, n);
        let signaled = signaled_after(&fx, &conn, skip);
        let expected: Vec<bool> = (0..n).map(|i| (i + 1) % batch == 0).collect();
        prop_assert_eq!(signaled, expected);

        fx.process(&conn);
        let completed = n - n % batch;
        prop_assert_eq!(fx.target.released(), tags[..completed].to_vec());
        prop_assert_eq!(conn.pending_coalesced(), n % batch);
        prop_assert_eq!(conn.outstanding_sends(), n % batch);

        let handle = conn.clone();
        fx.transport.free_connection(conn).unwrap();
        prop_assert_eq!(handle.outstanding_sends(), 0);
        prop_assert_eq!(fx.target.released().len(), n);
    }
}
