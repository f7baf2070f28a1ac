#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
#[non_exhaustive]
#[allow(missing_docs)] // the variant names are the documentation
/// Built-in method tags. A method whose flags include `SPECIAL` carries one
/// of these instead of an IL body; the interpreter forwards the call to the
/// hardware-access hook. Implementations may stub any subset; an unhandled
/// tag raises `MissingMethod`.
pub enum NativeMethod {
    None = 0,
    HardwareLevelAccessSetPinMode = 1,
    HardwareLevelAccessWritePin = 2,
    HardwareLevelAccessReadPin = 3,
    HardwareLevelAccessGetPinMode = 4,
    HardwareLevelAccessIsPinModeSupported = 5,
    HardwareLevelAccessGetPinCount = 6,
    EnvironmentTickCount = 7,
    EnvironmentTickCount64 = 8,
    EnvironmentProcessorCount = 9,
    EnvironmentFailFast = 10,
    SleepMicroseconds = 12,
    GetMicroseconds = 13,
    ObjectEquals = 14,
    ObjectGetHashCode = 15,
    ObjectReferenceEquals = 16,
    ObjectToString = 17,
    ObjectGetType = 18,
    ObjectMemberwiseClone = 19,
    StringEquals = 23,
    StringToString = 24,
    StringGetHashCode = 25,
    StringSetElem = 26,
    StringGetElem = 27,
    StringEqualsStatic = 30,
    StringFastAllocateString = 31,
    StringUnEqualsStatic = 32,
    StringImplicitConversion = 33,
    StringCompareTo = 37,
    RuntimeHelpersInitializeArray = 39,
    RuntimeHelpersRunClassConstructor = 40,
    TypeGetTypeFromHandle = 42,
    TypeEquals = 43,
    TypeIsEnum = 45,
    TypeTypeHandle = 46,
    TypeIsValueType = 47,
    TypeIsSubclassOf = 48,
    TypeIsAssignableFrom = 49,
    TypeGetHashCode = 52,
    TypeIsArray = 56,
    TypeGetElementType = 57,
    TypeGetBaseType = 60,
    ValueTypeGetHashCode = 61,
    ValueTypeEquals = 62,
    ValueTypeToString = 63,
    BitConverterSingleToInt32Bits = 64,
    BitConverterDoubleToInt64Bits = 65,
    BitConverterInt64BitsToDouble = 67,
    BitConverterInt32BitsToSingle = 68,
    BitOperationsLog2SoftwareFallback = 70,
    BitOperationsTrailingZeroCount = 71,
    EnumGetHashCode = 72,
    EnumToUInt64 = 73,
    EnumInternalBoxEnum = 74,
    BufferMemmove = 86,
    BufferZeroMemory = 87,
    RuntimeHelpersGetHashCode = 88,
    RuntimeTypeHandleValue = 94,
    InteropGetRandomBytes = 98,
    I2cDeviceReadByte = 99,
    I2cDeviceReadSpan = 100,
    I2cDeviceWriteByte = 101,
    I2cDeviceWriteSpan = 102,
    I2cDeviceWriteRead = 103,
    I2cDeviceInit = 104,
    InteropQueryPerformanceFrequency = 107,
    InteropQueryPerformanceCounter = 108,
    DateTimeUtcNow = 112,
    ArrayCopyCore = 114,
    ArrayClear = 115,
    ArrayInternalCreate = 116,
    ArraySetValue = 117,
    ArrayGetValue = 118,
    ArrayGetLength = 119,
    ActivatorCreateInstance = 120,
    GcCollect = 121,
    GcGetTotalMemory = 122,
    GcGetTotalAllocatedBytes = 123,
    GcTotalAvailableMemoryBytes = 124,
    MathCeiling = 125,
    MathFloor = 126,
    MathPow = 127,
    MathLog = 128,
    MathLog2 = 129,
    MathLog10 = 130,
    MathSin = 131,
    MathCos = 132,
    MathTan = 133,
    MathSqrt = 134,
    MathExp = 135,
    MathAbs = 136,
    DebugWriteLine = 137,
    FileOpen = 139,
    FileSetLastError = 140,
    FileGetLastError = 141,
    FileSeek = 142,
    FileClose = 143,
    FileSetEndOfFile = 144,
    FileWrite = 145,
    FileRead = 148,
    FileFlush = 150,
}

impl From<u16> for NativeMethod {
    fn from(value: u16) -> Self {
        use strum::IntoEnumIterator;
        Self::iter().find(|m| *m as u16 == value).unwrap_or(Self::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn native_method_round_trip() {
        for method in NativeMethod::iter() {
            assert_eq!(NativeMethod::from(method as u16), method);
        }
        assert_eq!(NativeMethod::from(0x7000), NativeMethod::None);
    }
}
