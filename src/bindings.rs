use alloy::sol;

sol!(
    #![sol(all_derives = true)]

    contract IERC721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }

    contract IERC1155 {
        event TransferSingle(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256 id,
            uint256 value
        );

        event TransferBatch(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256[] ids,
            uint256[] values
        );
    }
);
