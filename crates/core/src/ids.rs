use rand::RngCore;

/// 任务ID的随机字节数，对应 24 个十六进制字符
pub const TASK_ID_BYTES: usize = 12;

/// 生成 `len` 字节随机数的十六进制字符串
pub fn new_random_id(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_task_id() -> String {
    new_random_id(TASK_ID_BYTES)
}
