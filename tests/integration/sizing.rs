use std::num::NonZeroUsize;
use std::time::Duration;

use macy_core::wire::decode;
use macy_core::{Codec, Report};

use crate::*;

/// Fixed-size reports arrive at exactly the configured size and still decode.
#[tokio::test]
async fn test_fixed_size_datagrams_on_the_wire() {
    let a = loopback_socket().await.unwrap();
    let b = loopback_socket().await.unwrap();

    let report = Report::new("sizer")
        .with_heard("10.1.1.1", Duration::from_millis(250))
        .with_heard("fe80::1", Duration::from_secs(3));

    for size in [200usize, 576, 1400, 9000] {
        let codec = Codec::new(NonZeroUsize::new(size));
        let datagram = codec.encode(&report).unwrap();
        assert_eq!(datagram.len(), size);

        a.send_to(&datagram, b.local_addr().unwrap()).await.unwrap();
        let (data, _) = recv_datagram(&b).await.unwrap();
        assert_eq!(data.len(), size, "size {size}");
        assert_eq!(decode(&data).unwrap(), report);
    }
}

/// With no size configured the datagram is just the compressed report.
#[tokio::test]
async fn test_unsized_datagram_is_compact() {
    let report = Report::new("tiny");
    let datagram = Codec::new(None).encode(&report).unwrap();

    assert!(datagram.len() < 64, "{} bytes", datagram.len());
    assert_eq!(&datagram[..4], b"macy");
}
