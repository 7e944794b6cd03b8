use crate::data::Data;
use crate::event::Event;

/// Sentinel state meaning the state machine hit a protocol error and stops
/// consuming input.
pub const STATE_ERROR: i32 = -1;

/// What the deframer feeds the state machine on each `on_state` call.
pub enum Input<'a> {
    /// One byte, in byte-scan mode.
    Byte(u8),
    /// The completed fill-buffer requested by `ReadCmd::fill`.
    Filled(&'a [u8]),
    /// The completed rope requested by `ReadCmd::fill_data`.
    FilledData(Data),
}

/// Read-mode request written by the state machine for the bytes that follow.
/// Defaults back to byte-scan after every transition unless set again.
#[derive(Default)]
pub struct ReadCmd {
    next: Option<NextRead>,
}

enum NextRead {
    Fill(usize),
    FillData(usize),
    Pass(usize),
    PassAll(bool),
}

impl ReadCmd {
    /// Consume exactly `n` bytes into an internal buffer, then deliver it as
    /// `Input::Filled`.
    pub fn fill(&mut self, n: usize) {
        self.next = Some(NextRead::Fill(n));
    }

    /// Consume exactly `n` bytes into a rope, then deliver it as
    /// `Input::FilledData`.
    pub fn fill_data(&mut self, n: usize) {
        self.next = Some(NextRead::FillData(n));
    }

    /// Hand the next `n` bytes to `on_pass` chunk by chunk without byte-level
    /// inspection, then call `on_state` once more with an empty fill.
    pub fn pass(&mut self, n: usize) {
        self.next = Some(NextRead::Pass(n));
    }

    /// Pass every byte through `on_pass` until further notice.
    pub fn pass_all(&mut self, on: bool) {
        self.next = Some(NextRead::PassAll(on));
    }
}

/// State-machine hooks implemented by each binary decoder.
pub trait Deframe {
    /// Called per byte in scan mode or once per completed fill. Returns the
    /// next state, or `STATE_ERROR` to stop.
    fn on_state(
        &mut self,
        state: i32,
        input: Input,
        cmd: &mut ReadCmd,
        out: &mut dyn FnMut(Event),
    ) -> i32;

    /// Receives pass-through bytes as they arrive. The default forwards them
    /// downstream unchanged, which is what body passthrough wants.
    fn on_pass(&mut self, data: Data, out: &mut dyn FnMut(Event)) {
        out(Event::Data(data));
    }
}

enum Mode {
    Scan,
    Fill { want: usize, buf: Vec<u8> },
    FillData { want: usize, buf: Data },
    Pass { want: usize },
    PassAll,
}

/// Drives a `Deframe` implementation over successive `Data` events, carrying
/// partial reads across event boundaries. Feeding the same bytes split at any
/// boundary produces the same sequence of states and outputs.
pub struct Deframer {
    state: i32,
    mode: Mode,
}

impl Deframer {
    pub fn new(state: i32) -> Deframer {
        Deframer {
            state,
            mode: Mode::Scan,
        }
    }

    pub fn state(&self) -> i32 {
        self.state
    }

    /// Drops any partial buffering and restarts from `state`. Called on
    /// `StreamEnd` and on pipeline reuse.
    pub fn reset(&mut self, state: i32) {
        self.state = state;
        self.mode = Mode::Scan;
    }

    /// True when the machine is mid-frame, i.e. a `StreamEnd` here would cut
    /// a message short.
    pub fn is_mid_frame(&self) -> bool {
        match self.mode {
            Mode::Scan | Mode::PassAll => false,
            _ => true,
        }
    }

    /// Pre-arm a read mode before the first byte arrives (e.g. a fixed-size
    /// frame header).
    pub fn arm(&mut self, f: impl FnOnce(&mut ReadCmd)) {
        let mut cmd = ReadCmd::default();
        f(&mut cmd);
        self.apply(cmd);
    }

    fn apply(&mut self, cmd: ReadCmd) {
        match cmd.next {
            Some(NextRead::Fill(n)) => {
                self.mode = Mode::Fill {
                    want: n,
                    buf: Vec::with_capacity(n),
                }
            }
            Some(NextRead::FillData(n)) => {
                self.mode = Mode::FillData {
                    want: n,
                    buf: Data::new(),
                }
            }
            Some(NextRead::Pass(n)) => self.mode = Mode::Pass { want: n },
            Some(NextRead::PassAll(true)) => self.mode = Mode::PassAll,
            Some(NextRead::PassAll(false)) | None => self.mode = Mode::Scan,
        }
    }

    /// Consumes `data`, invoking the driver's hooks. Leftover bytes after an
    /// error state remain unconsumed.
    pub fn deframe<D: Deframe>(
        &mut self,
        driver: &mut D,
        data: &mut Data,
        out: &mut dyn FnMut(Event),
    ) {
        while !data.is_empty() && self.state != STATE_ERROR {
            match &mut self.mode {
                Mode::Scan => {
                    let mut scratch = Data::new();
                    let mut cmd = ReadCmd::default();
                    let mut state = self.state;
                    data.shift_while(
                        |c| {
                            if state == STATE_ERROR || cmd.next.is_some() {
                                return false;
                            }
                            state = driver.on_state(state, Input::Byte(c), &mut cmd, out);
                            true
                        },
                        &mut scratch,
                    );
                    self.state = state;
                    self.apply(cmd);
                }
                Mode::Fill { want, buf } => {
                    let take = (*want - buf.len()).min(data.len());
                    let mut piece = Data::new();
                    data.shift_to(take, &mut piece);
                    piece.for_each_chunk(|s| buf.extend_from_slice(s));
                    if buf.len() == *want {
                        let bytes = std::mem::replace(buf, Vec::new());
                        let mut cmd = ReadCmd::default();
                        self.state =
                            driver.on_state(self.state, Input::Filled(&bytes), &mut cmd, out);
                        self.mode = Mode::Scan;
                        self.apply(cmd);
                    }
                }
                Mode::FillData { want, buf } => {
                    let take = (*want - buf.len()).min(data.len());
                    data.shift_to(take, buf);
                    if buf.len() == *want {
                        let rope = std::mem::replace(buf, Data::new());
                        let mut cmd = ReadCmd::default();
                        self.state =
                            driver.on_state(self.state, Input::FilledData(rope), &mut cmd, out);
                        self.mode = Mode::Scan;
                        self.apply(cmd);
                    }
                }
                Mode::Pass { want } => {
                    let take = (*want).min(data.len());
                    let mut piece = Data::new();
                    data.shift_to(take, &mut piece);
                    *want -= take;
                    driver.on_pass(piece, out);
                    if *want == 0 {
                        let mut cmd = ReadCmd::default();
                        self.state =
                            driver.on_state(self.state, Input::Filled(&[]), &mut cmd, out);
                        self.mode = Mode::Scan;
                        self.apply(cmd);
                    }
                }
                Mode::PassAll => {
                    let piece = std::mem::replace(data, Data::new());
                    driver.on_pass(piece, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A toy length-prefixed framing: 1-byte length, then that many payload
    // bytes delivered via fill_data, then a 2-byte trailer via fill.
    struct Toy {
        frames: Vec<(Vec<u8>, Vec<u8>)>,
    }

    const LEN: i32 = 0;
    const PAYLOAD: i32 = 1;
    const TRAILER: i32 = 2;

    impl Deframe for Toy {
        fn on_state(
            &mut self,
            state: i32,
            input: Input,
            cmd: &mut ReadCmd,
            _out: &mut dyn FnMut(Event),
        ) -> i32 {
            match (state, input) {
                (LEN, Input::Byte(n)) => {
                    cmd.fill_data(n as usize);
                    PAYLOAD
                }
                (PAYLOAD, Input::FilledData(data)) => {
                    self.frames.push((data.to_vec(), Vec::new()));
                    cmd.fill(2);
                    TRAILER
                }
                (TRAILER, Input::Filled(bytes)) => {
                    self.frames
                        .last_mut()
                        .expect("payload seen before trailer")
                        .1 = bytes.to_vec();
                    LEN
                }
                _ => STATE_ERROR,
            }
        }
    }

    fn run(input: &[u8], split_at: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut toy = Toy { frames: Vec::new() };
        let mut deframer = Deframer::new(LEN);
        let mut sink = |_evt: Event| {};
        let (a, b) = input.split_at(split_at);
        for piece in [a, b].iter() {
            let mut data = Data::from_slice(piece);
            deframer.deframe(&mut toy, &mut data, &mut sink);
        }
        toy.frames
    }

    #[test]
    fn test_framing_split_invariance() {
        let input = b"\x03abcXY\x02deZW";
        let expect = vec![
            (b"abc".to_vec(), b"XY".to_vec()),
            (b"de".to_vec(), b"ZW".to_vec()),
        ];
        // Same frames no matter where the chunk boundary falls.
        for split in 0..=input.len() {
            assert_eq!(run(input, split), expect, "split at {}", split);
        }
    }

    #[test]
    fn test_pass_through() {
        struct Pass;
        impl Deframe for Pass {
            fn on_state(
                &mut self,
                state: i32,
                input: Input,
                cmd: &mut ReadCmd,
                _out: &mut dyn FnMut(Event),
            ) -> i32 {
                match (state, input) {
                    (0, Input::Byte(n)) => {
                        cmd.pass(n as usize);
                        1
                    }
                    (1, Input::Filled(_)) => 0,
                    _ => STATE_ERROR,
                }
            }
        }

        let mut driver = Pass;
        let mut deframer = Deframer::new(0);
        let mut passed = Vec::new();
        let mut data = Data::from_slice(b"\x04body\x02ok");
        deframer.deframe(&mut driver, &mut data, &mut |evt| {
            if let Event::Data(d) = evt {
                passed.push(d.to_vec());
            }
        });

        assert_eq!(passed.concat(), b"bodyok");
        assert_eq!(deframer.state(), 0);
        assert!(!deframer.is_mid_frame());
    }

    #[test]
    fn test_error_stops_consuming() {
        struct Fail;
        impl Deframe for Fail {
            fn on_state(
                &mut self,
                _state: i32,
                _input: Input,
                _cmd: &mut ReadCmd,
                _out: &mut dyn FnMut(Event),
            ) -> i32 {
                STATE_ERROR
            }
        }

        let mut driver = Fail;
        let mut deframer = Deframer::new(0);
        let mut data = Data::from_slice(b"abc");
        deframer.deframe(&mut driver, &mut data, &mut |_| {});

        assert_eq!(deframer.state(), STATE_ERROR);
        // First byte consumed by the failing transition, the rest untouched.
        assert_eq!(data.to_vec(), b"bc");
    }
}
