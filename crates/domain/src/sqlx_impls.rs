//! # SQLx 数据库类型转换实现
//!
//! 本模块仅在启用 `sqlx-support` feature 时编译
//! 状态枚举以文本形式存储，编解码复用 `as_str` / `FromStr`

use crate::entities::{
    ComputeResourceStatus, ComputeResourceType, ExperimentStatus, StagingOperationStatus,
    TaskStatus, WorkerStatus,
};

macro_rules! sqlite_text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl sqlx::Type<sqlx::Sqlite> for $ty {
                fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                    <str as sqlx::Type<sqlx::Sqlite>>::type_info()
                }

                fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                    <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
                }
            }

            impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
                fn decode(
                    value: sqlx::sqlite::SqliteValueRef<'r>,
                ) -> Result<Self, sqlx::error::BoxDynError> {
                    let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                    s.parse::<$ty>().map_err(Into::into)
                }
            }

            impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
                fn encode_by_ref(
                    &self,
                    buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
                ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                    <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
                }
            }
        )+
    };
}

sqlite_text_enum!(
    TaskStatus,
    WorkerStatus,
    ExperimentStatus,
    ComputeResourceType,
    ComputeResourceStatus,
    StagingOperationStatus,
);
