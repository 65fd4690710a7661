/// Adler32-style rolling checksum over a fixed-size window.
///
/// Two 16-bit sums (a, b) combined into a 32-bit digest; sliding the window by
/// one byte is O(1).
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct RollingHash {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingHash {
    /// Hash of `window`; later rolls keep its length.
    pub fn over(window: &[u8]) -> Self {
        // Sums stay far below u64::MAX for any block size used here, so a
        // single reduction at the end is enough.
        let (a, b) = window.iter().fold((1u64, 0u64), |(a, b), &byte| {
            let a = a + byte as u64;
            (a, b + a)
        });
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            window: window.len() as u32,
        }
    }

    /// Drop `leaving` from the front of the window and append `entering`.
    pub fn roll(&mut self, leaving: u8, entering: u8) {
        let out = leaving as u32;
        let inn = entering as u32;
        self.a = (self.a + MOD_ADLER - out + inn) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a - (out * self.window) % MOD_ADLER) % MOD_ADLER;
    }

    pub fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
