//! The attribute predicate language fed to readers.
//!
//! A filter is a space-separated list of verbs applied to named attributes:
//!
//! ```text
//! -keep_below Z 10 -drop_above Intensity 200 -keep_class 2 8
//! ```
//!
//! Verbs combine with AND; a point survives when every predicate accepts it.

use std::collections::HashSet;

use crate::error::{CoreError, Result};
use crate::header::Header;
use crate::point::Point;

#[derive(Debug, Clone)]
enum Predicate {
    KeepBelow(String, f64),
    KeepAbove(String, f64),
    KeepBetween(String, f64, f64),
    KeepEqual(String, f64),
    KeepDifferent(String, f64),
    KeepIn(String, Vec<f64>),
    KeepOut(String, Vec<f64>),
    DropBelow(String, f64),
    DropAbove(String, f64),
    DropBetween(String, f64, f64),
    DropEqual(String, f64),
    DropIn(String, Vec<f64>),
    DropDuplicate,
}

/// A parsed, reusable filter expression.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    predicates: Vec<Predicate>,
    seen: HashSet<(i64, i64, i64)>,
}

impl PointFilter {
    /// Parse a filter string. An empty string yields a pass-all filter.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut predicates = Vec::new();
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        let mut i = 0;

        while i < tokens.len() {
            let verb = tokens[i]
                .strip_prefix('-')
                .ok_or_else(|| CoreError::FilterToken(tokens[i].to_string()))?;

            // Shorthand for the most common LAS filter.
            if verb == "keep_class" || verb == "drop_class" {
                let values = take_numbers(&tokens, i + 1);
                if values.is_empty() {
                    return Err(CoreError::FilterToken(tokens[i].to_string()));
                }
                i += 1 + values.len();
                let attr = "Classification".to_string();
                predicates.push(if verb == "keep_class" {
                    Predicate::KeepIn(attr, values)
                } else {
                    Predicate::DropIn(attr, values)
                });
                continue;
            }

            if verb == "drop_duplicate" || verb == "drop_duplicates" {
                predicates.push(Predicate::DropDuplicate);
                i += 1;
                continue;
            }

            let attr = tokens
                .get(i + 1)
                .ok_or_else(|| CoreError::FilterToken(tokens[i].to_string()))?
                .to_string();

            let arity2 = |tokens: &[&str], i: usize| -> Result<(f64, f64)> {
                let a = parse_number(tokens, i + 2)?;
                let b = parse_number(tokens, i + 3)?;
                Ok((a, b))
            };

            match verb {
                "keep_below" => {
                    predicates.push(Predicate::KeepBelow(attr, parse_number(&tokens, i + 2)?));
                    i += 3;
                }
                "keep_above" => {
                    predicates.push(Predicate::KeepAbove(attr, parse_number(&tokens, i + 2)?));
                    i += 3;
                }
                "keep_between" => {
                    let (a, b) = arity2(&tokens, i)?;
                    predicates.push(Predicate::KeepBetween(attr, a, b));
                    i += 4;
                }
                "keep_equal" => {
                    predicates.push(Predicate::KeepEqual(attr, parse_number(&tokens, i + 2)?));
                    i += 3;
                }
                "keep_different" => {
                    predicates.push(Predicate::KeepDifferent(attr, parse_number(&tokens, i + 2)?));
                    i += 3;
                }
                "keep_in" => {
                    let values = take_numbers(&tokens, i + 2);
                    if values.is_empty() {
                        return Err(CoreError::FilterToken(tokens[i].to_string()));
                    }
                    i += 2 + values.len();
                    predicates.push(Predicate::KeepIn(attr, values));
                }
                "keep_out" => {
                    let values = take_numbers(&tokens, i + 2);
                    if values.is_empty() {
                        return Err(CoreError::FilterToken(tokens[i].to_string()));
                    }
                    i += 2 + values.len();
                    predicates.push(Predicate::KeepOut(attr, values));
                }
                "drop_below" => {
                    predicates.push(Predicate::DropBelow(attr, parse_number(&tokens, i + 2)?));
                    i += 3;
                }
                "drop_above" => {
                    predicates.push(Predicate::DropAbove(attr, parse_number(&tokens, i + 2)?));
                    i += 3;
                }
                "drop_between" => {
                    let (a, b) = arity2(&tokens, i)?;
                    predicates.push(Predicate::DropBetween(attr, a, b));
                    i += 4;
                }
                "drop_equal" => {
                    predicates.push(Predicate::DropEqual(attr, parse_number(&tokens, i + 2)?));
                    i += 3;
                }
                "drop_in" => {
                    let values = take_numbers(&tokens, i + 2);
                    if values.is_empty() {
                        return Err(CoreError::FilterToken(tokens[i].to_string()));
                    }
                    i += 2 + values.len();
                    predicates.push(Predicate::DropIn(attr, values));
                }
                _ => return Err(CoreError::FilterToken(tokens[i].to_string())),
            }
        }

        Ok(Self { predicates, seen: HashSet::new() })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Whether the point survives the filter. Duplicate tracking mutates the
    /// filter, which is why readers own a private instance per chunk.
    pub fn keep(&mut self, p: &Point, header: &Header) -> Result<bool> {
        for pred in &self.predicates {
            let ok = match pred {
                Predicate::KeepBelow(a, v) => attr(p, a, header)? < *v,
                Predicate::KeepAbove(a, v) => attr(p, a, header)? > *v,
                Predicate::KeepBetween(a, lo, hi) => {
                    let x = attr(p, a, header)?;
                    x >= *lo && x < *hi
                }
                Predicate::KeepEqual(a, v) => attr(p, a, header)? == *v,
                Predicate::KeepDifferent(a, v) => attr(p, a, header)? != *v,
                Predicate::KeepIn(a, vs) => vs.contains(&attr(p, a, header)?),
                Predicate::KeepOut(a, vs) => !vs.contains(&attr(p, a, header)?),
                Predicate::DropBelow(a, v) => attr(p, a, header)? >= *v,
                Predicate::DropAbove(a, v) => attr(p, a, header)? <= *v,
                Predicate::DropBetween(a, lo, hi) => {
                    let x = attr(p, a, header)?;
                    x < *lo || x >= *hi
                }
                Predicate::DropEqual(a, v) => attr(p, a, header)? != *v,
                Predicate::DropIn(a, vs) => !vs.contains(&attr(p, a, header)?),
                Predicate::DropDuplicate => {
                    let key = quantize(p, header);
                    self.seen.insert(key)
                }
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Forget the duplicate-tracking state between chunks.
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

fn attr(p: &Point, name: &str, header: &Header) -> Result<f64> {
    p.attribute(name, header)
        .ok_or_else(|| CoreError::FilterAttribute(name.to_string()))
}

fn quantize(p: &Point, header: &Header) -> (i64, i64, i64) {
    let (sx, sy, sz) = header.scale;
    (
        ((p.x - header.offset.0) / sx).round() as i64,
        ((p.y - header.offset.1) / sy).round() as i64,
        ((p.z - header.offset.2) / sz).round() as i64,
    )
}

fn parse_number(tokens: &[&str], i: usize) -> Result<f64> {
    tokens
        .get(i)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| CoreError::FilterToken(tokens.get(i).unwrap_or(&"<eol>").to_string()))
}

fn take_numbers(tokens: &[&str], from: usize) -> Vec<f64> {
    tokens[from.min(tokens.len())..]
        .iter()
        .map_while(|t| t.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(z: f64, class: u8) -> Point {
        Point { z, classification: class, ..Default::default() }
    }

    #[test]
    fn keep_below_and_class() {
        let header = Header::default();
        let mut f = PointFilter::parse("-keep_below Z 10 -keep_class 2 8").unwrap();
        assert!(f.keep(&point(5.0, 2), &header).unwrap());
        assert!(!f.keep(&point(15.0, 2), &header).unwrap());
        assert!(!f.keep(&point(5.0, 1), &header).unwrap());
    }

    #[test]
    fn keep_between_is_half_open() {
        let header = Header::default();
        let mut f = PointFilter::parse("-keep_between Z 0 10").unwrap();
        assert!(f.keep(&point(0.0, 0), &header).unwrap());
        assert!(!f.keep(&point(10.0, 0), &header).unwrap());
    }

    #[test]
    fn drop_duplicate_tracks_scaled_coordinates() {
        let header = Header::default();
        let mut f = PointFilter::parse("-drop_duplicate").unwrap();
        let p = point(1.0, 0);
        assert!(f.keep(&p, &header).unwrap());
        assert!(!f.keep(&p, &header).unwrap());
        f.reset();
        assert!(f.keep(&p, &header).unwrap());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(PointFilter::parse("keep_below Z 10").is_err());
        assert!(PointFilter::parse("-keep_below Z").is_err());
        assert!(PointFilter::parse("-frobnicate Z 1").is_err());
    }

    #[test]
    fn unknown_attribute_is_an_error() {
        let header = Header::default();
        let mut f = PointFilter::parse("-keep_below Altitude 10").unwrap();
        assert!(f.keep(&point(0.0, 0), &header).is_err());
    }
}
