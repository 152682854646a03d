use anyhow::Result;
use bytes::BytesMut;
use sfu_server_codec::rtcp::{
    Decoder, Packet,
    feedback::{FirEntry, FullIntraRequest, NackPair, TransportLayerNack},
    remb::ReceiverEstimatedMaximumBitrate,
    report::{ReceiverReport, ReceptionReport, SenderReport},
    sdes::SourceDescription,
};

#[rustfmt::skip]
mod samples {
    pub const SENDER_REPORT: &[u8] = &[
        0x80, 0xc8, 0x00, 0x06, 0x79, 0x26, 0x69, 0x55, 0xe8, 0xe2, 0xe2, 0x17,
        0xd4, 0x2f, 0x05, 0x91, 0x36, 0x01, 0xb0, 0xaf, 0x34, 0x85, 0x78, 0x5e,
        0x2d, 0xbc, 0x2a, 0x98,
    ];
}

#[test]
fn test_sender_report_sample() -> Result<()> {
    let packets = Decoder::decode(samples::SENDER_REPORT)?;
    assert_eq!(packets.len(), 1);

    let Packet::SenderReport(sr) = &packets[0] else {
        return Err(anyhow::anyhow!("expected SenderReport"));
    };

    assert_eq!(sr.ssrc, 0x79266955);
    assert_eq!(sr.ntp_time, 0xe8e2e217d42f0591);
    assert_eq!(sr.rtp_time, 0x3601b0af);
    assert_eq!(sr.packet_count, 0x3485785e);
    assert_eq!(sr.octet_count, 0x2dbc2a98);
    assert!(sr.reports.is_empty());

    Ok(())
}

#[test]
fn test_compound_round_trip() -> Result<()> {
    let mut bytes = BytesMut::new();

    ReceiverReport {
        ssrc: 0x902f9e2e,
        reports: vec![ReceptionReport {
            ssrc: 0xbc5e9a40,
            fraction_lost: 12,
            total_lost: 4,
            last_sequence_number: 0x00010203,
            jitter: 250,
            last_sender_report: 0x16232589,
            delay: 131072,
        }],
    }
    .encode(&mut bytes);

    ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 0x902f9e2e,
        bitrate: 512_000,
        ssrcs: vec![0xbc5e9a40, 0xbc5e9a41],
    }
    .encode(&mut bytes);

    SourceDescription::cname(0x902f9e2e, "sfu@example").encode(&mut bytes);

    let packets = Decoder::decode(&bytes)?;
    assert_eq!(packets.len(), 3);

    let Packet::ReceiverReport(rr) = &packets[0] else {
        return Err(anyhow::anyhow!("expected ReceiverReport"));
    };

    assert_eq!(rr.ssrc, 0x902f9e2e);
    assert_eq!(rr.reports[0].total_lost, 4);
    assert_eq!(rr.reports[0].last_sequence_number, 0x00010203);
    assert_eq!(rr.reports[0].delay, 131072);

    let Packet::ReceiverEstimatedMaximumBitrate(remb) = &packets[1] else {
        return Err(anyhow::anyhow!("expected REMB"));
    };

    assert_eq!(remb.bitrate, 512_000);
    assert_eq!(remb.ssrcs, vec![0xbc5e9a40, 0xbc5e9a41]);

    let Packet::SourceDescription(sdes) = &packets[2] else {
        return Err(anyhow::anyhow!("expected SourceDescription"));
    };

    assert_eq!(sdes.chunks[0].cname.as_deref(), Some("sfu@example"));

    Ok(())
}

#[test]
fn test_feedback_round_trip() -> Result<()> {
    let mut bytes = BytesMut::new();

    FullIntraRequest {
        sender_ssrc: 0x1111,
        media_ssrc: 0,
        fir: vec![FirEntry {
            ssrc: 0x2222,
            sequence_number: 9,
        }],
    }
    .encode(&mut bytes);

    TransportLayerNack {
        sender_ssrc: 0x1111,
        media_ssrc: 0x2222,
        nacks: vec![NackPair {
            packet_id: 65534,
            lost_packets: 0b101,
        }],
    }
    .encode(&mut bytes);

    let packets = Decoder::decode(&bytes)?;
    assert_eq!(packets.len(), 2);

    let Packet::FullIntraRequest(fir) = &packets[0] else {
        return Err(anyhow::anyhow!("expected FullIntraRequest"));
    };

    assert_eq!(fir.fir[0].ssrc, 0x2222);
    assert_eq!(fir.fir[0].sequence_number, 9);

    let Packet::TransportLayerNack(nack) = &packets[1] else {
        return Err(anyhow::anyhow!("expected TransportLayerNack"));
    };

    // 65534 wraps through zero.
    let seqnos: Vec<u16> = nack.nacks[0].sequence_numbers().collect();
    assert_eq!(seqnos, vec![65534, 65535, 1]);

    Ok(())
}

#[test]
fn test_unknown_packets_skipped() -> Result<()> {
    // An XR (PT 207, not a known packet type at all), then a BYE (a
    // known type with no variant), then a PLI. Only the PLI survives;
    // neither stranger aborts the compound.
    let buffer = [
        0x80, 0xcf, 0x00, 0x02, 0x00, 0x00, 0x11, 0x11, 0xde, 0xad, 0xbe, 0xef,
        0x81, 0xcb, 0x00, 0x01, 0x00, 0x00, 0x11, 0x11, 0x81, 0xce, 0x00, 0x02,
        0x00, 0x00, 0x11, 0x11, 0x00, 0x00, 0x22, 0x22,
    ];

    let packets = Decoder::decode(&buffer)?;
    assert_eq!(packets.len(), 1);
    assert!(matches!(packets[0], Packet::PictureLossIndication(_)));

    Ok(())
}

#[test]
fn test_truncated_packet_rejected() {
    // Header claims 28 bytes, buffer holds 8.
    let buffer = [0x80, 0xc8, 0x00, 0x06, 0x79, 0x26, 0x69, 0x55];
    assert!(Decoder::decode(&buffer).is_err());
}
