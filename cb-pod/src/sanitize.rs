// Copyright (c) Facebook, Inc. and its affiliates.

//! Convert any `Serialize` value into a `serde_json::Value` that is
//! guaranteed to be valid JSON. Non-finite floats become `null`, one warning
//! per occurrence. Map keys JSON can't represent are an error.
use log::warn;
use serde::ser::{self, Impossible, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("map key must be a string, got {0}")]
    KeyNotString(&'static str),
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for SanitizeError {
    fn custom<T: Display>(msg: T) -> Self {
        SanitizeError::Custom(msg.to_string())
    }
}

#[derive(Debug)]
pub struct Sanitized {
    pub value: Value,
    pub nr_replaced: usize,
}

pub fn sanitize<T: Serialize + ?Sized>(input: &T) -> Result<Sanitized, SanitizeError> {
    let mut nr_replaced = 0;
    let value = input.serialize(Sanitizer {
        nr_replaced: &mut nr_replaced,
    })?;
    Ok(Sanitized { value, nr_replaced })
}

struct Sanitizer<'a> {
    nr_replaced: &'a mut usize,
}

impl<'a> Sanitizer<'a> {
    fn nested<T: Serialize + ?Sized>(
        nr_replaced: &mut usize,
        value: &T,
    ) -> Result<Value, SanitizeError> {
        value.serialize(Sanitizer { nr_replaced })
    }
}

impl<'a> ser::Serializer for Sanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;
    type SerializeSeq = SeqSanitizer<'a>;
    type SerializeTuple = SeqSanitizer<'a>;
    type SerializeTupleStruct = SeqSanitizer<'a>;
    type SerializeTupleVariant = SeqSanitizer<'a>;
    type SerializeMap = MapSanitizer<'a>;
    type SerializeStruct = MapSanitizer<'a>;
    type SerializeStructVariant = MapSanitizer<'a>;

    fn serialize_bool(self, v: bool) -> Result<Value, SanitizeError> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, SanitizeError> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i16(self, v: i16) -> Result<Value, SanitizeError> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i32(self, v: i32) -> Result<Value, SanitizeError> {
        self.serialize_i64(v as i64)
    }

    fn serialize_i64(self, v: i64) -> Result<Value, SanitizeError> {
        Ok(Value::from(v))
    }

    fn serialize_u8(self, v: u8) -> Result<Value, SanitizeError> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u16(self, v: u16) -> Result<Value, SanitizeError> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u32(self, v: u32) -> Result<Value, SanitizeError> {
        self.serialize_u64(v as u64)
    }

    fn serialize_u64(self, v: u64) -> Result<Value, SanitizeError> {
        Ok(Value::from(v))
    }

    fn serialize_f32(self, v: f32) -> Result<Value, SanitizeError> {
        self.serialize_f64(v as f64)
    }

    fn serialize_f64(self, v: f64) -> Result<Value, SanitizeError> {
        if v.is_finite() {
            Ok(Value::from(v))
        } else {
            warn!("client: replacing non-finite value {} with null", v);
            *self.nr_replaced += 1;
            Ok(Value::Null)
        }
    }

    fn serialize_char(self, v: char) -> Result<Value, SanitizeError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Value, SanitizeError> {
        Ok(Value::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, SanitizeError> {
        Ok(Value::Array(v.iter().map(|b| Value::from(*b)).collect()))
    }

    fn serialize_none(self) -> Result<Value, SanitizeError> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, SanitizeError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value, SanitizeError> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, SanitizeError> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
    ) -> Result<Value, SanitizeError> {
        Ok(Value::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, SanitizeError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, SanitizeError> {
        let mut map = Map::new();
        map.insert(variant.to_string(), value.serialize(self)?);
        Ok(Value::Object(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqSanitizer<'a>, SanitizeError> {
        Ok(SeqSanitizer {
            nr_replaced: self.nr_replaced,
            variant: None,
            vec: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqSanitizer<'a>, SanitizeError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqSanitizer<'a>, SanitizeError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqSanitizer<'a>, SanitizeError> {
        let mut seq = self.serialize_seq(Some(len))?;
        seq.variant = Some(variant);
        Ok(seq)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapSanitizer<'a>, SanitizeError> {
        Ok(MapSanitizer {
            nr_replaced: self.nr_replaced,
            variant: None,
            map: Map::new(),
            next_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<MapSanitizer<'a>, SanitizeError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<MapSanitizer<'a>, SanitizeError> {
        let mut map = self.serialize_map(Some(len))?;
        map.variant = Some(variant);
        Ok(map)
    }
}

fn wrap_variant(variant: Option<&'static str>, value: Value) -> Value {
    match variant {
        Some(variant) => {
            let mut map = Map::new();
            map.insert(variant.to_string(), value);
            Value::Object(map)
        }
        None => value,
    }
}

struct SeqSanitizer<'a> {
    nr_replaced: &'a mut usize,
    variant: Option<&'static str>,
    vec: Vec<Value>,
}

impl<'a> SeqSanitizer<'a> {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SanitizeError> {
        self.vec
            .push(Sanitizer::nested(&mut *self.nr_replaced, value)?);
        Ok(())
    }

    fn finish(self) -> Result<Value, SanitizeError> {
        Ok(wrap_variant(self.variant, Value::Array(self.vec)))
    }
}

impl<'a> ser::SerializeSeq for SeqSanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SanitizeError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, SanitizeError> {
        self.finish()
    }
}

impl<'a> ser::SerializeTuple for SeqSanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SanitizeError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, SanitizeError> {
        self.finish()
    }
}

impl<'a> ser::SerializeTupleStruct for SeqSanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SanitizeError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, SanitizeError> {
        self.finish()
    }
}

impl<'a> ser::SerializeTupleVariant for SeqSanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SanitizeError> {
        self.push(value)
    }

    fn end(self) -> Result<Value, SanitizeError> {
        self.finish()
    }
}

struct MapSanitizer<'a> {
    nr_replaced: &'a mut usize,
    variant: Option<&'static str>,
    map: Map<String, Value>,
    next_key: Option<String>,
}

impl<'a> MapSanitizer<'a> {
    fn insert<T: Serialize + ?Sized>(&mut self, key: String, value: &T) -> Result<(), SanitizeError> {
        let value = Sanitizer::nested(&mut *self.nr_replaced, value)?;
        self.map.insert(key, value);
        Ok(())
    }

    fn finish(self) -> Result<Value, SanitizeError> {
        Ok(wrap_variant(self.variant, Value::Object(self.map)))
    }
}

impl<'a> ser::SerializeMap for MapSanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), SanitizeError> {
        self.next_key = Some(key.serialize(KeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SanitizeError> {
        match self.next_key.take() {
            Some(key) => self.insert(key, value),
            None => Err(SanitizeError::Custom("map value without a key".into())),
        }
    }

    fn end(self) -> Result<Value, SanitizeError> {
        self.finish()
    }
}

impl<'a> ser::SerializeStruct for MapSanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), SanitizeError> {
        self.insert(key.to_string(), value)
    }

    fn end(self) -> Result<Value, SanitizeError> {
        self.finish()
    }
}

impl<'a> ser::SerializeStructVariant for MapSanitizer<'a> {
    type Ok = Value;
    type Error = SanitizeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), SanitizeError> {
        self.insert(key.to_string(), value)
    }

    fn end(self) -> Result<Value, SanitizeError> {
        self.finish()
    }
}

/// Map keys: strings, and scalars which have an obvious string form.
struct KeySerializer;

impl ser::Serializer for KeySerializer {
    type Ok = String;
    type Error = SanitizeError;
    type SerializeSeq = Impossible<String, SanitizeError>;
    type SerializeTuple = Impossible<String, SanitizeError>;
    type SerializeTupleStruct = Impossible<String, SanitizeError>;
    type SerializeTupleVariant = Impossible<String, SanitizeError>;
    type SerializeMap = Impossible<String, SanitizeError>;
    type SerializeStruct = Impossible<String, SanitizeError>;
    type SerializeStructVariant = Impossible<String, SanitizeError>;

    fn serialize_bool(self, v: bool) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_i8(self, v: i8) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, _v: f32) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("float"))
    }

    fn serialize_f64(self, _v: f64) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("float"))
    }

    fn serialize_char(self, v: char) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_str(self, v: &str) -> Result<String, SanitizeError> {
        Ok(v.to_string())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("bytes"))
    }

    fn serialize_none(self) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("none"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("option"))
    }

    fn serialize_unit(self) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("unit"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("unit struct"))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _idx: u32,
        variant: &'static str,
    ) -> Result<String, SanitizeError> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, SanitizeError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _idx: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, SanitizeError> {
        Err(SanitizeError::KeyNotString("enum"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, SanitizeError> {
        Err(SanitizeError::KeyNotString("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, SanitizeError> {
        Err(SanitizeError::KeyNotString("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, SanitizeError> {
        Err(SanitizeError::KeyNotString("tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _idx: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, SanitizeError> {
        Err(SanitizeError::KeyNotString("enum"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, SanitizeError> {
        Err(SanitizeError::KeyNotString("map"))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, SanitizeError> {
        Err(SanitizeError::KeyNotString("struct"))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _idx: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, SanitizeError> {
        Err(SanitizeError::KeyNotString("enum"))
    }
}
