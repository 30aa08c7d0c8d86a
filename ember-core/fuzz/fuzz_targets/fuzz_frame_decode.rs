#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

use ember_core::protocol::{FrameCodec, Request};

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(data);

    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = frame.body_len();
        if frame.is_request() {
            let _ = Request::decode(&frame);
        }
    }
});
