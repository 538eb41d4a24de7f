#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = vec![];
    gl_capture::rle::write(&mut buf, data).expect("encoding failed");
    let mut encoded = &buf[..];
    match gl_capture::rle::read(&mut encoded, Some(data.len())) {
        Ok(vec) => assert_eq!(vec, data),
        Err(e) => panic!("Error: {}", e),
    }
});
