//! Text tokenizer built on the `tokenizers` crate.
//!
//! Three on-disk formats are understood, chosen by file extension:
//!
//! | extension | format                                         |
//! |-----------|------------------------------------------------|
//! | `.json`   | `tokenizer.json` as written by `tokenizers`    |
//! | `.model`  | SentencePiece model protobuf (unigram or BPE)  |
//! | other     | word-level vocabulary, one token per line      |
//!
//! SentencePiece and word-level files are converted to the equivalent
//! `tokenizers` JSON description and loaded from that.

use std::path::Path;

use serde_json::json;

use crate::error::Error;

/// Unknown token used by word-level vocabularies.
pub const UNKNOWN_TOKEN: &str = "[UNK]";

const METASPACE: char = '\u{2581}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerFormat {
    HuggingFace,
    SentencePiece,
    WordLevel,
}

impl TokenizerFormat {
    pub fn from_raw(v: u32) -> Result<Self, Error> {
        match v {
            0 => Ok(TokenizerFormat::HuggingFace),
            1 => Ok(TokenizerFormat::SentencePiece),
            2 => Ok(TokenizerFormat::WordLevel),
            other => Err(Error::InvalidArgument(format!("tokenizer format {other}"))),
        }
    }

    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => TokenizerFormat::HuggingFace,
            Some("model") => TokenizerFormat::SentencePiece,
            _ => TokenizerFormat::WordLevel,
        }
    }
}

pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    format: TokenizerFormat,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("format", &self.format)
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

fn tok_err(e: impl std::fmt::Display) -> Error {
    Error::Tokenizer(e.to_string())
}

impl Tokenizer {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let blob = std::fs::read(path)?;
        Self::from_blob(&blob, TokenizerFormat::detect(path))
    }

    pub fn from_blob(blob: &[u8], format: TokenizerFormat) -> Result<Self, Error> {
        let inner = match format {
            TokenizerFormat::HuggingFace => {
                tokenizers::Tokenizer::from_bytes(blob).map_err(tok_err)?
            }
            TokenizerFormat::SentencePiece => {
                let model = sentencepiece::parse_model(blob)?;
                load_json(&sentencepiece::to_json(&model)?)?
            }
            TokenizerFormat::WordLevel => load_json(&word_level_json(blob)?)?,
        };
        Ok(Self { inner, format })
    }

    pub fn format(&self) -> TokenizerFormat {
        self.format
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, Error> {
        let encoding = self.inner.encode(text, false).map_err(tok_err)?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String, Error> {
        self.inner.decode(ids, false).map_err(tok_err)
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

fn load_json(value: &serde_json::Value) -> Result<tokenizers::Tokenizer, Error> {
    let text = serde_json::to_string(value).map_err(tok_err)?;
    text.parse::<tokenizers::Tokenizer>().map_err(tok_err)
}

fn word_level_json(blob: &[u8]) -> Result<serde_json::Value, Error> {
    let text = std::str::from_utf8(blob).map_err(tok_err)?;
    let mut vocab = serde_json::Map::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let id = vocab.len();
        vocab.entry(line.to_string()).or_insert(json!(id));
    }
    if !vocab.contains_key(UNKNOWN_TOKEN) {
        let id = vocab.len();
        vocab.insert(UNKNOWN_TOKEN.to_string(), json!(id));
    }
    Ok(json!({
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": UNKNOWN_TOKEN },
        "pre_tokenizer": { "type": "Whitespace" },
    }))
}

/// Just enough of the SentencePiece `ModelProto` to rebuild a unigram or BPE
/// model.
mod sentencepiece {
    use std::collections::HashMap;

    use super::{json, tok_err, Error, METASPACE};

    const TYPE_NORMAL: u64 = 1;
    const TYPE_UNKNOWN: u64 = 2;
    const TYPE_BYTE: u64 = 6;

    /// `TrainerSpec.model_type`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ModelType {
        Unigram,
        Bpe,
        Word,
        Char,
    }

    impl ModelType {
        fn from_raw(v: u64) -> Result<Self, Error> {
            match v {
                1 => Ok(ModelType::Unigram),
                2 => Ok(ModelType::Bpe),
                3 => Ok(ModelType::Word),
                4 => Ok(ModelType::Char),
                other => Err(Error::Tokenizer(format!("unknown sentencepiece model type {other}"))),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Model {
        pub model_type: ModelType,
        pub pieces: Vec<Piece>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Piece {
        pub piece: String,
        pub score: f32,
        pub kind: u64,
    }

    struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        fn done(&self) -> bool {
            self.pos >= self.buf.len()
        }

        fn truncated() -> Error {
            Error::Tokenizer("truncated sentencepiece model".into())
        }

        fn varint(&mut self) -> Result<u64, Error> {
            let mut value = 0u64;
            for shift in (0..64).step_by(7) {
                let byte = *self.buf.get(self.pos).ok_or_else(Self::truncated)?;
                self.pos += 1;
                value |= u64::from(byte & 0x7f) << shift;
                if byte & 0x80 == 0 {
                    return Ok(value);
                }
            }
            Err(Error::Tokenizer("varint too long".into()))
        }

        fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
            let end = self.pos.checked_add(n).ok_or_else(Self::truncated)?;
            let out = self.buf.get(self.pos..end).ok_or_else(Self::truncated)?;
            self.pos = end;
            Ok(out)
        }

        fn length_delimited(&mut self) -> Result<&'a [u8], Error> {
            let n = self.varint()? as usize;
            self.bytes(n)
        }

        fn skip(&mut self, wire_type: u64) -> Result<(), Error> {
            match wire_type {
                0 => self.varint().map(drop),
                1 => self.bytes(8).map(drop),
                2 => self.length_delimited().map(drop),
                5 => self.bytes(4).map(drop),
                other => Err(Error::Tokenizer(format!("unsupported wire type {other}"))),
            }
        }
    }

    fn parse_piece(buf: &[u8]) -> Result<Piece, Error> {
        let mut r = Reader::new(buf);
        let mut piece = Piece {
            piece: String::new(),
            score: 0.0,
            kind: 1,
        };
        while !r.done() {
            let key = r.varint()?;
            match (key >> 3, key & 7) {
                (1, 2) => {
                    piece.piece = String::from_utf8(r.length_delimited()?.to_vec()).map_err(tok_err)?
                }
                (2, 5) => {
                    let b = r.bytes(4)?;
                    piece.score = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                }
                (3, 0) => piece.kind = r.varint()?,
                (_, wire) => r.skip(wire)?,
            }
        }
        Ok(piece)
    }

    /// `model_type` (field 3) of a serialized `TrainerSpec`. Unigram when
    /// absent.
    fn parse_model_type(buf: &[u8]) -> Result<ModelType, Error> {
        let mut r = Reader::new(buf);
        let mut model_type = ModelType::Unigram;
        while !r.done() {
            let key = r.varint()?;
            match (key >> 3, key & 7) {
                (3, 0) => model_type = ModelType::from_raw(r.varint()?)?,
                (_, wire) => r.skip(wire)?,
            }
        }
        Ok(model_type)
    }

    /// The `pieces` (field 1), in id order, and the model type from
    /// `trainer_spec` (field 2).
    pub fn parse_model(blob: &[u8]) -> Result<Model, Error> {
        let mut r = Reader::new(blob);
        let mut pieces = Vec::new();
        let mut model_type = ModelType::Unigram;
        while !r.done() {
            let key = r.varint()?;
            match (key >> 3, key & 7) {
                (1, 2) => pieces.push(parse_piece(r.length_delimited()?)?),
                (2, 2) => model_type = parse_model_type(r.length_delimited()?)?,
                (_, wire) => r.skip(wire)?,
            }
        }
        if pieces.is_empty() {
            return Err(Error::Tokenizer("sentencepiece model has no pieces".into()));
        }
        Ok(Model { model_type, pieces })
    }

    /// BPE merges recovered from the vocabulary: every split of a normal
    /// piece into two pieces that are themselves in the vocabulary. Ranked
    /// by the merged piece's score, highest first, then by the ids of the
    /// halves.
    fn merges(pieces: &[Piece]) -> Vec<(String, String)> {
        let ids: HashMap<&str, usize> = pieces
            .iter()
            .enumerate()
            .map(|(id, p)| (p.piece.as_str(), id))
            .collect();
        let mut ranked = Vec::new();
        for merged in pieces.iter().filter(|p| p.kind == TYPE_NORMAL) {
            for (at, _) in merged.piece.char_indices().skip(1) {
                let (left, right) = merged.piece.split_at(at);
                if let (Some(&l), Some(&r)) = (ids.get(left), ids.get(right)) {
                    ranked.push((merged.score, l, r));
                }
            }
        }
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        ranked
            .into_iter()
            .map(|(_, l, r)| (pieces[l].piece.clone(), pieces[r].piece.clone()))
            .collect()
    }

    pub fn to_json(model: &Model) -> Result<serde_json::Value, Error> {
        let pieces = &model.pieces;
        let unk_id = pieces.iter().position(|p| p.kind == TYPE_UNKNOWN).unwrap_or(0);
        let byte_fallback = pieces.iter().any(|p| p.kind == TYPE_BYTE);
        let inner = match model.model_type {
            ModelType::Unigram => {
                let vocab: Vec<_> = pieces.iter().map(|p| json!([p.piece, p.score])).collect();
                json!({
                    "type": "Unigram",
                    "unk_id": unk_id,
                    "vocab": vocab,
                    "byte_fallback": byte_fallback,
                })
            }
            ModelType::Bpe => {
                let mut vocab = serde_json::Map::new();
                for (id, p) in pieces.iter().enumerate() {
                    vocab.entry(p.piece.clone()).or_insert(json!(id));
                }
                let merges: Vec<_> = merges(pieces).into_iter().map(|(l, r)| json!([l, r])).collect();
                json!({
                    "type": "BPE",
                    "dropout": null,
                    "unk_token": pieces[unk_id].piece,
                    "continuing_subword_prefix": null,
                    "end_of_word_suffix": null,
                    "fuse_unk": true,
                    "byte_fallback": byte_fallback,
                    "ignore_merges": false,
                    "vocab": vocab,
                    "merges": merges,
                })
            }
            other => {
                return Err(Error::Tokenizer(format!(
                    "sentencepiece {other:?} models are not supported"
                )))
            }
        };
        let metaspace = json!({
            "type": "Metaspace",
            "replacement": METASPACE,
            "prepend_scheme": "always",
            "split": true,
        });
        Ok(json!({
            "model": inner,
            "pre_tokenizer": metaspace,
            "decoder": metaspace,
        }))
    }

    #[cfg(test)]
    pub(super) fn encode_model(pieces: &[(&str, f32, u64)], model_type: u64) -> Vec<u8> {
        fn varint(out: &mut Vec<u8>, mut v: u64) {
            while v >= 0x80 {
                out.push((v as u8) | 0x80);
                v >>= 7;
            }
            out.push(v as u8);
        }
        let mut model = Vec::new();
        for (text, score, kind) in pieces {
            let mut p = Vec::new();
            p.push(0x0a);
            varint(&mut p, text.len() as u64);
            p.extend_from_slice(text.as_bytes());
            p.push(0x15);
            p.extend_from_slice(&score.to_le_bytes());
            p.push(0x18);
            varint(&mut p, *kind);
            model.push(0x0a);
            varint(&mut model, p.len() as u64);
            model.extend_from_slice(&p);
        }
        // trainer_spec { model_type }
        model.extend_from_slice(&[0x12, 0x02, 0x18]);
        varint(&mut model, model_type);
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: &str = "hello\nworld\n\nfoo\n";

    fn sp_model() -> Vec<u8> {
        sentencepiece::encode_model(
            &[
                ("<unk>", 0.0, 2),
                ("\u{2581}hello", -1.0, 1),
                ("\u{2581}world", -1.5, 1),
                ("\u{2581}", -3.0, 1),
            ],
            1,
        )
    }

    fn sp_bpe_model() -> Vec<u8> {
        sentencepiece::encode_model(
            &[
                ("<unk>", 0.0, 2),
                ("\u{2581}h", -1.0, 1),
                ("\u{2581}hi", -2.0, 1),
                ("h", -3.0, 1),
                ("i", -4.0, 1),
                ("\u{2581}", -5.0, 1),
            ],
            2,
        )
    }

    #[test]
    fn format_detection() {
        assert_eq!(TokenizerFormat::detect(Path::new("t.json")), TokenizerFormat::HuggingFace);
        assert_eq!(TokenizerFormat::detect(Path::new("sp.model")), TokenizerFormat::SentencePiece);
        assert_eq!(TokenizerFormat::detect(Path::new("vocab.txt")), TokenizerFormat::WordLevel);
        assert_eq!(TokenizerFormat::detect(Path::new("vocab")), TokenizerFormat::WordLevel);
        assert!(TokenizerFormat::from_raw(3).is_err());
    }

    #[test]
    fn word_level_round_trip() {
        let t = Tokenizer::from_blob(VOCAB.as_bytes(), TokenizerFormat::WordLevel).unwrap();
        assert_eq!(t.vocab_size(), 4);
        assert_eq!(t.encode("hello foo world").unwrap(), vec![0, 2, 1]);
        assert_eq!(t.encode("bar").unwrap(), vec![3]);
        assert_eq!(t.decode(&[0, 1]).unwrap(), "hello world");
        assert_eq!(t.token_to_id("foo"), Some(2));
        assert_eq!(t.id_to_token(1).as_deref(), Some("world"));
        assert_eq!(t.id_to_token(99), None);
    }

    #[test]
    fn json_tokenizer_loads() {
        let json = word_level_json(VOCAB.as_bytes()).unwrap().to_string();
        let t = Tokenizer::from_blob(json.as_bytes(), TokenizerFormat::HuggingFace).unwrap();
        assert_eq!(t.format(), TokenizerFormat::HuggingFace);
        assert_eq!(t.encode("world hello").unwrap(), vec![1, 0]);
        assert!(Tokenizer::from_blob(b"{ nope", TokenizerFormat::HuggingFace).is_err());
    }

    #[test]
    fn sentencepiece_pieces_are_parsed() {
        let model = sentencepiece::parse_model(&sp_model()).unwrap();
        assert_eq!(model.model_type, sentencepiece::ModelType::Unigram);
        let pieces = &model.pieces;
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[1].piece, "\u{2581}hello");
        assert_eq!(pieces[2].score, -1.5);
        assert_eq!(pieces[0].kind, 2);

        assert!(sentencepiece::parse_model(&[0x0a, 0x05, 0x0a]).is_err());
        assert!(sentencepiece::parse_model(&[]).is_err());
    }

    #[test]
    fn sentencepiece_tokenizer_encodes() {
        let t = Tokenizer::from_blob(&sp_model(), TokenizerFormat::SentencePiece).unwrap();
        assert_eq!(t.vocab_size(), 4);
        assert_eq!(t.token_to_id("\u{2581}world"), Some(2));
        assert_eq!(t.encode("hello world").unwrap(), vec![1, 2]);
    }

    #[test]
    fn sentencepiece_bpe_uses_merges() {
        let model = sentencepiece::parse_model(&sp_bpe_model()).unwrap();
        assert_eq!(model.model_type, sentencepiece::ModelType::Bpe);
        let json = sentencepiece::to_json(&model).unwrap();
        assert_eq!(json["model"]["type"], "BPE");
        assert_eq!(
            json["model"]["merges"],
            serde_json::json!([["\u{2581}", "h"], ["\u{2581}h", "i"]])
        );

        let t = Tokenizer::from_blob(&sp_bpe_model(), TokenizerFormat::SentencePiece).unwrap();
        assert_eq!(t.vocab_size(), 6);
        assert_eq!(t.encode("hi").unwrap(), vec![2]);
        assert_eq!(t.encode("ih").unwrap(), vec![5, 4, 3]);
        assert_eq!(t.decode(&[2]).unwrap(), "hi");
    }

    #[test]
    fn sentencepiece_word_models_are_rejected() {
        let blob = sentencepiece::encode_model(&[("<unk>", 0.0, 2), ("\u{2581}a", 0.0, 1)], 3);
        assert!(matches!(
            Tokenizer::from_blob(&blob, TokenizerFormat::SentencePiece),
            Err(Error::Tokenizer(_))
        ));
    }

    #[test]
    fn from_file_uses_extension() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = dir.path().join("vocab.txt");
        std::fs::write(&vocab, VOCAB).unwrap();
        let t = Tokenizer::from_file(&vocab).unwrap();
        assert_eq!(t.format(), TokenizerFormat::WordLevel);

        let sp = dir.path().join("sp.model");
        std::fs::write(&sp, sp_model()).unwrap();
        assert_eq!(Tokenizer::from_file(&sp).unwrap().format(), TokenizerFormat::SentencePiece);

        assert!(matches!(
            Tokenizer::from_file(&dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
