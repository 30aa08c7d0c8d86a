#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

use ember_core::protocol::{FrameCodec, Response};

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(data);

    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let response = Response::decode(&frame);
        let _ = response.to_frame();
    }
});
