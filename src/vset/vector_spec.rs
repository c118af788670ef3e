use super::VsetError;

/// A vector given on the command line, plus how many arguments it used.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorSpec {
    pub values: Vec<f32>,
    /// Target dimension requested with `REDUCE`.
    pub reduce: Option<usize>,
    pub consumed: usize,
}

pub fn eq_ignore_case(arg: &[u8], word: &str) -> bool {
    arg.eq_ignore_ascii_case(word.as_bytes())
}

pub fn parse_number<T: std::str::FromStr>(arg: &[u8]) -> Option<T> {
    std::str::from_utf8(arg).ok()?.trim().parse().ok()
}

/// Parses `[REDUCE <dim>] FP32 <blob> | VALUES <n> <v1> .. <vn>` starting at
/// `args[start]`. `REDUCE` is only honored when `allow_reduce` is set.
pub fn parse_vector(
    args: &[Vec<u8>],
    start: usize,
    allow_reduce: bool,
) -> Result<VectorSpec, VsetError> {
    let mut pos = start;
    let mut reduce = None;

    if allow_reduce && args.len() > pos + 2 && eq_ignore_case(&args[pos], "REDUCE") {
        let dim: usize = parse_number(&args[pos + 1]).ok_or(VsetError::InvalidVectorSpec)?;
        if dim == 0 {
            return Err(VsetError::InvalidVectorSpec);
        }
        reduce = Some(dim);
        pos += 2;
    }

    let kind = args.get(pos).ok_or(VsetError::InvalidVectorSpec)?;
    let values = if eq_ignore_case(kind, "FP32") {
        let blob = args.get(pos + 1).ok_or(VsetError::InvalidVectorSpec)?;
        if blob.is_empty() || blob.len() % 4 != 0 {
            return Err(VsetError::InvalidVectorSpec);
        }
        pos += 2;
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect::<Vec<f32>>()
    } else if eq_ignore_case(kind, "VALUES") {
        let count: usize = args
            .get(pos + 1)
            .and_then(|a| parse_number(a))
            .ok_or(VsetError::InvalidVectorSpec)?;
        let end = pos
            .checked_add(2)
            .and_then(|p| p.checked_add(count))
            .filter(|&end| count > 0 && end <= args.len())
            .ok_or(VsetError::InvalidVectorSpec)?;
        let values = args[pos + 2..end]
            .iter()
            .map(|a| parse_number::<f64>(a).map(|v| v as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or(VsetError::InvalidVectorSpec)?;
        pos = end;
        values
    } else {
        return Err(VsetError::InvalidVectorSpec);
    };

    if values.iter().any(|v| !v.is_finite()) {
        return Err(VsetError::InvalidVectorSpec);
    }

    Ok(VectorSpec {
        values,
        reduce,
        consumed: pos - start,
    })
}
