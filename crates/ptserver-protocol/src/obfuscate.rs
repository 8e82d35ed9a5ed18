//! Ginger (variants 1-3) and per-session codebook (v8.2+) obfuscation.
//!
//! Transliterated from the reverse-engineered `encode.c`, preserving its
//! integer truncation behavior (the `unsigned short` casts at each `ustoa`
//! call site) and its two acknowledged oddities: the `becuase` typo baked
//! into the ginger string, and the `32678` (not `32768`) scale factor used
//! for the check digit. Both are load-bearing for wire compatibility with
//! real clients and must never be "corrected".

use rand::Rng;

use crate::wire::CODEBOOK_LEN;

/// I recall how quickly this caught my eye when I first started reversing
/// the encoding stuff. Note the glaring typo "becuase" -- not sure if it's
/// a 'feature' or a genuine typo, but it persists.
const GINGER: &[u8] =
    b"Ginger was a big fat horse, a big fat horse was she. But don't tell that\
 to MaryLou becuase in love with her is she.I tell you this in private, \
because I thought that you should know.But never say to MaryLou or both \
our heads will go.I've said it once, I've said it twice, I'll say it onc\
e again.Not a word of this to you know who or it will be our end!\r";

const CODEBOOK1: &[u8] =
    b"WhEther it was me or wEather it was you, tis not the poinT I say. The Po\
int tHat be is nOt to SEe ThE difference betWEen you and me.Four sconeS \
and some ten pEnce EonS ago I loSt mY way. MaNy eOns have pAst since thE\
n but I still don'T have much to sAY; THIRTENN AnD A HAlF DoLLARS FOR A \
HAMBURGER?  WHAT'S IN tHE SPECIAL SAUCE, GOLD NUGGETS!";

const CODEBOOK2: &[u8] =
    b"95kjgr-t0GFGllbcbivvb;vmbl;kw-gmncFGDnxcvlkjt9^&*^$$)nfds0--rwefnfmcnfr9\
0493jeGFDGsmkteotept;fdge;KL454954385rka8%^#)@gkfg0t3;l,0pejgfgkjgklfgke\
rBVB03b  mB bibBV3rtnjfyggo9geaogig968959fk85jnfgsmCVbrkf,.er'wslr985BNV\
BVXCV-9=]dlfkgVCVCVrkdgdgoB NJfgfx;ldffgjkDDGjkfdgkjreo-reFETUtogld0986b\
mUYUjTfhkgoxiopggopflgkfdogdopgdlbdmgket0ettl;hglhmnll";

const CODEBOOK1_LEN: usize = 342;
const CODEBOOK2_LEN: usize = 342;
const CODEBOOK2_STEP_MASK: u32 = 15;
const CODEBOOK3_STEP_MASK: u32 = 15;

const ENCODE_MAX_LEN: usize = crate::wire::ENCODE_MAX_LEN;
const DECODE_MAX_LEN: usize = crate::wire::DECODE_MAX_LEN;

const TENPOW: [u32; 5] = [1000, 100, 10, 1, 0];

/// The classic M$ `rand()`.
fn ms_seed(x: u32) -> u32 {
    x.wrapping_mul(0x343fd).wrapping_add(0x269e3c)
}

fn ms_rand(x: u32) -> u32 {
    (ms_seed(x) >> 16) & 0x7fff
}

/// Per-session codebook generation parameters and table.
#[derive(Clone)]
pub struct Codebook {
    pub cb1_offset: u16,
    pub cb2_step: u16,
    pub cb3_step: u16,
    table: Box<[u8; CODEBOOK_LEN]>,
}

impl Codebook {
    /// Mixes the two source codebooks into a session-unique table, the way
    /// `pt_encode_cook_codebook` does -- except the three random parameters
    /// come from the `rand` crate rather than `srand(clock)/rand()`, which is
    /// an equivalent source of unpredictability for this non-interoperable
    /// (server-chosen, never decoded by the client) piece of state.
    pub fn generate(rng: &mut impl Rng) -> Self {
        let cb1_offset = 1 + rng.gen_range(0..(CODEBOOK1_LEN as u32 >> 2));
        let cb2_step = 1 + (rng.gen::<u32>() & CODEBOOK2_STEP_MASK);
        let cb3_step = 1 + (rng.gen::<u32>() & CODEBOOK3_STEP_MASK);

        let mut table = Box::new([0u8; CODEBOOK_LEN]);
        let mut i = 0usize;
        while i < CODEBOOK_LEN {
            table[i] = if (i >> 1) & 1 != 0 {
                CODEBOOK2[(((i >> 2) + 1) as u32 * cb2_step) as usize % CODEBOOK2_LEN]
            } else {
                CODEBOOK1[((i >> 2) as u32 + cb1_offset) as usize % CODEBOOK1_LEN]
            };
            table[i + 1] = b'0' + ((((i >> 1) + 1) as u32 * cb3_step) % 0x4b) as u8;
            i += 2;
        }

        Codebook {
            cb1_offset: cb1_offset as u16,
            cb2_step: cb2_step as u16,
            cb3_step: cb3_step as u16,
            table,
        }
    }

    fn at(&self, index: usize) -> u8 {
        self.table[index % CODEBOOK_LEN]
    }
}

/// Per-connection obfuscation state: the running check-digit LCG seed plus
/// an optional v8.2+ codebook. One instance lives on the connection context.
pub struct Obfuscator {
    /// `ctx->time` in source, kept separate from the connection's last-ping
    /// timestamp (see design notes: the two were one field in source).
    seed: u32,
    codebook: Option<Codebook>,
}

impl Obfuscator {
    pub fn new(seed: u32) -> Self {
        Obfuscator { seed, codebook: None }
    }

    pub fn set_codebook(&mut self, cb: Codebook) {
        self.codebook = Some(cb);
    }

    pub fn codebook(&self) -> Option<&Codebook> {
        self.codebook.as_ref()
    }

    pub fn has_codebook(&self) -> bool {
        self.codebook.is_some()
    }

    /// Encodes `s` with the given ginger variant (1-3) and challenge, or with
    /// the session codebook if one has been generated for a v8.2+ connection.
    pub fn encode(&mut self, variant: u32, challenge: u16, s: &[u8], rng: &mut impl Rng) -> Option<Vec<u8>> {
        if self.codebook.is_some() {
            return Some(self.encode_with_codebook(challenge, s, rng));
        }
        self.encode_ginger(variant, challenge, s)
    }

    fn encode_ginger(&mut self, variant: u32, challenge: u16, s: &[u8]) -> Option<Vec<u8>> {
        if variant == 0 || variant > 3 || s.is_empty() {
            return None;
        }
        let slen = s.len().min(ENCODE_MAX_LEN);
        let mut out = Vec::with_capacity(slen * 4);
        let mut chal = challenge as i64;

        for i in 0..slen {
            let b = s[i] as i64;
            let full: i64 = match variant {
                1 => 0x7a + (i as i64) * (13 - i as i64) + b + ginger(chal, i),
                2 => 0x7a + i as i64 + b + ginger(chal, i),
                3 => {
                    let v = 0x7a + b + ginger(0, i) + chal * (i as i64);
                    chal -= 1;
                    v
                }
                _ => unreachable!(),
            };
            let truncated = (full as i32) as u16;
            let v = (truncated as u32) % 1000;
            push_digits(&mut out, v, 3);

            let check = ((ms_rand(self.seed) as f64 / 32678.0) * 10.0).floor() as u32 & 7;
            out.push(b'0' + check as u8);
            self.seed = ms_seed(self.seed);
        }

        Some(out)
    }

    fn encode_with_codebook(&mut self, challenge: u16, s: &[u8], rng: &mut impl Rng) -> Vec<u8> {
        let cb = self.codebook.as_ref().expect("codebook present");
        let r15 = || rng_15(rng);

        let s_pos_raw = r15() * CODEBOOK_LEN.saturating_sub(256).min(8999) as u32;
        let s_pos = 1001 + ((s_pos_raw >> 15) | ((s_pos_raw >> 14) & 1));

        let pad_groups = 1 + u32::from(s_pos % 3 == 0) + u32::from(s_pos & 3 == 0);
        let mut out = Vec::with_capacity((pad_groups as usize + s.len()) * 4);
        push_digits(&mut out, s_pos, 4);
        for _ in 4..(pad_groups * 4) {
            out.push(b'0' + rng.gen_range(0..10u8));
        }

        for (i, &byte) in s.iter().enumerate() {
            let cbv = cb.at(challenge as usize + i) as i64;
            let full = 0x71i64 + i as i64 + byte as i64 + cbv;
            let truncated = (full as i32) as u16;
            let v = (truncated as u32) % 1000;

            let mut digits = [0u8; 3];
            push_digits_into(&mut digits, v, 3);

            let a_raw = r15() * 9;
            let a = (1 + ((a_raw >> 15) | ((a_raw >> 14) & 1))) % 10;
            for d in digits.iter_mut() {
                let mut val = (*d - b'0') as u32 + a;
                if val > 9 {
                    val -= 10;
                }
                *d = b'0' + val as u8;
            }

            let j = (cbv as u32 + i as u32 + s_pos) as usize & 3;
            let mut group = [0u8; 4];
            let mut src = 0;
            for (p, slot) in group.iter_mut().enumerate() {
                if p == j {
                    *slot = b'0' + a as u8;
                } else {
                    *slot = digits[src];
                    src += 1;
                }
            }
            out.extend_from_slice(&group);
        }

        out
    }

    /// Decodes `s`. Pure function of `(codebook|ginger, challenge, s)` --
    /// neither family touches `seed` on decode, matching source.
    pub fn decode(&self, variant: u32, challenge: u16, s: &[u8]) -> Option<Vec<u8>> {
        if let Some(cb) = &self.codebook {
            return decode_with_codebook(cb, challenge, s);
        }
        decode_ginger(variant, challenge, s)
    }

    /// Walks only the check digits, advancing `seed` exactly as `encode` did.
    /// Fails (and stops advancing) at the first mismatch.
    pub fn validate(&mut self, variant: u32, s: &[u8]) -> bool {
        if variant == 0 || variant > 3 || s.is_empty() || s.len() % 4 != 0 {
            return false;
        }
        for group in s.chunks(4) {
            let Some(&d) = group.get(3) else { return false };
            if !d.is_ascii_digit() {
                return false;
            }
            let want = (d - b'0') as u32;
            let got = ((ms_rand(self.seed) as f64 / 32678.0) * 10.0).floor() as u32 & 7;
            if want != got {
                return false;
            }
            self.seed = ms_seed(self.seed);
        }
        true
    }
}

fn ginger(challenge: i64, i: usize) -> i64 {
    let idx = (challenge + i as i64).rem_euclid(GINGER.len() as i64) as usize;
    GINGER[idx] as i64
}

fn rng_15(rng: &mut impl Rng) -> u32 {
    rng.gen_range(0..=0x7fffu32)
}

fn push_digits(out: &mut Vec<u8>, mut u: u32, len: usize) {
    let mut buf = vec![0u8; len];
    for i in 0..len {
        buf[len - 1 - i] = b'0' + (u % 10) as u8;
        u /= 10;
    }
    out.extend_from_slice(&buf);
}

fn push_digits_into(out: &mut [u8], mut u: u32, len: usize) {
    for i in 0..len {
        out[len - 1 - i] = b'0' + (u % 10) as u8;
        u /= 10;
    }
}

fn decode_ginger(variant: u32, challenge: u16, s: &[u8]) -> Option<Vec<u8>> {
    if variant == 0 || variant > 3 || s.is_empty() || s.len() % 4 != 0 {
        return None;
    }
    let slen = s.len().min(DECODE_MAX_LEN);
    let mut out = Vec::with_capacity(slen / 4);
    let mut chal = challenge as i64;

    for i in 0..slen / 4 {
        let g = &s[i * 4..i * 4 + 3];
        if !g.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let n = (g[0] - b'0') as i64 * 100 + (g[1] - b'0') as i64 * 10 + (g[2] - b'0') as i64;
        if n > 999 {
            return None;
        }

        let val = match variant {
            1 => n - 0x7a - (i as i64) * (13 - i as i64) - ginger(chal, i),
            2 => n - 0x7a - i as i64 - ginger(chal, i),
            3 => {
                let v = n - 0x7a - ginger(0, i) - chal * (i as i64);
                chal -= 1;
                v
            }
            _ => unreachable!(),
        };
        out.push(val as u8);
    }

    Some(out)
}

fn decode_with_codebook(cb: &Codebook, challenge: u16, s: &[u8]) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 4 != 0 {
        return None;
    }
    if !s[0..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let s_pos = (s[0] - b'0') as u32 * 1000
        + (s[1] - b'0') as u32 * 100
        + (s[2] - b'0') as u32 * 10
        + (s[3] - b'0') as u32;

    let pad = ((1 + u32::from(s_pos % 3 == 0) + u32::from(s_pos & 3 == 0)) * 4) as usize;
    if pad > s.len() {
        return None;
    }
    let body = &s[pad..];
    if !body.iter().all(u8::is_ascii_digit) {
        return None;
    }

    let mut out = Vec::with_capacity(body.len() / 4);
    for i in 0..body.len() / 4 {
        let cbv = cb.at(challenge as usize + i) as u32;
        let a_pos = ((cbv + i as u32 + s_pos) & 3) as usize;
        let group = &body[i * 4..i * 4 + 4];
        let a = (group[a_pos] - b'0') as i64;

        let mut n: i64 = 0;
        for j in 0..4 {
            let x = group[j] as i64 - a - b'0' as i64;
            let idx = if j == a_pos { 4 } else { j + usize::from(j < a_pos) };
            n += TENPOW[idx] as i64 * (x + 10).rem_euclid(10);
        }

        out.push((n - 0x71 - cbv as i64 - i as i64) as u8);
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn ginger_round_trip_all_variants() {
        for variant in 1..=3u32 {
            for challenge in [1u16, 17, 226] {
                let mut enc = Obfuscator::new(0x1234_5678);
                let mut r = rng();
                let s = b"hunter2-secret".to_vec();
                let encoded = enc.encode(variant, challenge, &s, &mut r).unwrap();
                let dec = Obfuscator::new(0);
                let decoded = dec.decode(variant, challenge, &encoded).unwrap();
                assert_eq!(decoded, s, "variant {variant} challenge {challenge}");
            }
        }
    }

    #[test]
    fn ginger_encode_truncates_and_rejects() {
        let mut enc = Obfuscator::new(1);
        let mut r = rng();
        assert!(enc.encode(1, 5, b"", &mut r).is_none());
        assert!(enc.encode(0, 5, b"x", &mut r).is_none());
        assert!(enc.encode(4, 5, b"x", &mut r).is_none());
    }

    #[test]
    fn codebook_round_trip() {
        let mut r = rng();
        let cb = Codebook::generate(&mut r);
        let mut enc = Obfuscator::new(7);
        enc.set_codebook(cb.clone());
        let s = b"p4ssw0rd".to_vec();
        let encoded = enc.encode_with_codebook(3, &s, &mut r);

        let dec = Codebook {
            cb1_offset: cb.cb1_offset,
            cb2_step: cb.cb2_step,
            cb3_step: cb.cb3_step,
            table: cb.table.clone(),
        };
        let decoded = decode_with_codebook(&dec, 3, &encoded).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn validate_matches_encode_check_digits() {
        let mut ctx = Obfuscator::new(99);
        let mut r = rng();
        let encoded = ctx.encode(2, 10, b"abc", &mut r).unwrap();
        let mut validator = Obfuscator::new(99);
        assert!(validator.validate(2, &encoded));
    }

    #[test]
    fn validate_rejects_tampered_check_digit() {
        let mut ctx = Obfuscator::new(99);
        let mut r = rng();
        let mut encoded = ctx.encode(2, 10, b"abc", &mut r).unwrap();
        let last = encoded.len() - 1;
        encoded[last] = if encoded[last] == b'0' { b'1' } else { b'0' };
        let mut validator = Obfuscator::new(99);
        assert!(!validator.validate(2, &encoded));
    }
}
