use rand::Rng;

use crate::errors::{AppError, AppResult};

pub const ROOM_CODE_LEN: usize = 6;
const ROOM_CODE_SPACE: u32 = 1_000_000;

pub fn generate_room_code() -> String {
    let mut value = [0u8; 4];
    rand::rng().fill_bytes(&mut value);
    let number = u32::from_be_bytes(value) % ROOM_CODE_SPACE;
    format!("{number:06}")
}

pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == ROOM_CODE_LEN && code.bytes().all(|byte| byte.is_ascii_digit())
}

pub fn normalize_room_code(input: &str) -> AppResult<String> {
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() || digits.len() > ROOM_CODE_LEN {
        return Err(AppError::new("room_code_invalid", "房间码必须是 6 位数字")
            .with_context("input", input.to_string()));
    }
    Ok(format!("{digits:0>6}"))
}
