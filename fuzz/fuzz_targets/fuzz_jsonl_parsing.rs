#![no_main]
use libfuzzer_sys::fuzz_target;
use transcript_capture::parser::LogStreamParser;
use transcript_capture::render::{render_markdown, RenderOptions};
use transcript_capture::transcript::Transcript;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must parse, fold and render without panicking.
    let transcript = Transcript::from_entries(LogStreamParser::new(data));
    let _ = render_markdown(&transcript, &RenderOptions::new("fuzz"));
});
